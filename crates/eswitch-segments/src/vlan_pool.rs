//! VLAN pool allocator.
//!
//! Keeps one row per `(physical_network, vlan_id)` with an `allocated` flag.
//! Pool rows exist for every id in every configured range; specific rows are
//! created on demand for reservations outside the ranges and are deleted
//! again on release.
//!
//! Every operation holds the pool's write lock for its full duration, so a
//! range replacement via [`VlanPool::sync_network_states`] is a
//! stop-the-world swap with respect to reservations.
//!
//! ## Persistence
//!
//! When created with [`VlanPool::with_state_file`] the pool can be saved to and
//! restored from a JSON snapshot of rows, ranges and bindings.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eswitch_types::{NetworkType, VlanTag};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{SegmentError, SegmentResult};
use crate::ranges::{is_in_ranges, VlanRangeMap};

/// Snapshot of one allocation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationIdAllocation {
    pub physical_network: String,
    pub segmentation_id: u16,
    pub allocated: bool,
}

/// Network id to segment mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub network_id: String,
    pub network_type: NetworkType,
    pub physical_network: String,
    pub segmentation_id: u16,
}

/// Provider attributes supplied when a network is created.
///
/// Missing attributes are filled from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub network_type: NetworkType,
    pub physical_network: Option<String>,
    pub segmentation_id: Option<u16>,
}

impl ProvisionRequest {
    /// A request with no provider attributes: any free segment will do.
    pub fn any(network_type: NetworkType) -> Self {
        Self {
            network_type,
            physical_network: None,
            segmentation_id: None,
        }
    }

    /// A request for an explicit segment.
    pub fn specific(
        network_type: NetworkType,
        physical_network: impl Into<String>,
        segmentation_id: u16,
    ) -> Self {
        Self {
            network_type,
            physical_network: Some(physical_network.into()),
            segmentation_id: Some(segmentation_id),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PoolState {
    /// physical_network -> vlan_id -> allocated
    rows: BTreeMap<String, BTreeMap<u16, bool>>,
    ranges: VlanRangeMap,
    bindings: BTreeMap<String, NetworkBinding>,
}

impl PoolState {
    fn row(&self, physical_network: &str, vlan_id: u16) -> Option<bool> {
        self.rows.get(physical_network)?.get(&vlan_id).copied()
    }

    fn sync(&mut self, ranges: &VlanRangeMap) {
        // Drop every unallocated row that no longer falls in a range
        for (physical_network, rows) in self.rows.iter_mut() {
            rows.retain(|vlan_id, allocated| {
                *allocated || is_in_ranges(ranges, physical_network, *vlan_id)
            });
        }

        for (physical_network, net_ranges) in ranges {
            let rows = self.rows.entry(physical_network.clone()).or_default();
            for range in net_ranges {
                for vlan_id in range.ids() {
                    rows.entry(vlan_id).or_insert(false);
                }
            }
        }

        self.rows.retain(|_, rows| !rows.is_empty());
        self.ranges = ranges.clone();
    }

    fn reserve_first(&mut self, physical_network: Option<&str>) -> SegmentResult<(String, u16)> {
        for (net, rows) in self.rows.iter_mut() {
            if physical_network.is_some_and(|p| p != net.as_str()) {
                continue;
            }
            if let Some((vlan_id, allocated)) = rows.iter_mut().find(|(_, a)| !**a) {
                *allocated = true;
                return Ok((net.clone(), *vlan_id));
            }
        }
        Err(SegmentError::NoNetworkAvailable)
    }

    fn reserve_specific(&mut self, physical_network: &str, vlan_id: u16) -> SegmentResult<()> {
        if vlan_id == 0 || vlan_id > VlanTag::MAX {
            return Err(SegmentError::InvalidSegmentationId {
                physical_network: physical_network.to_string(),
                vlan_id,
            });
        }

        let allocated = self
            .rows
            .entry(physical_network.to_string())
            .or_default()
            .entry(vlan_id)
            .or_insert(false);
        if *allocated {
            return Err(SegmentError::VlanIdInUse {
                physical_network: physical_network.to_string(),
                vlan_id,
            });
        }
        *allocated = true;
        Ok(())
    }

    fn release(&mut self, physical_network: &str, vlan_id: u16, ranges: &VlanRangeMap) -> bool {
        let Some(rows) = self.rows.get_mut(physical_network) else {
            return false;
        };
        if !rows.contains_key(&vlan_id) {
            return false;
        }

        if is_in_ranges(ranges, physical_network, vlan_id) {
            rows.insert(vlan_id, false);
        } else {
            rows.remove(&vlan_id);
            if rows.is_empty() {
                self.rows.remove(physical_network);
            }
        }
        true
    }
}

/// Segmentation id pool shared between the plugin side and the agent.
#[derive(Debug, Default)]
pub struct VlanPool {
    state: RwLock<PoolState>,
    state_file: Option<PathBuf>,
}

impl VlanPool {
    /// Creates an empty, memory-only pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty pool that persists to `path` on [`save`](Self::save).
    pub fn with_state_file(path: impl Into<PathBuf>) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            state_file: Some(path.into()),
        }
    }

    /// Opens a pool backed by `path`, restoring the snapshot if one exists.
    pub fn open(path: impl Into<PathBuf>) -> SegmentResult<Self> {
        let pool = Self::with_state_file(path);
        if let Some(path) = pool.state_file.as_deref() {
            if path.exists() {
                let restored = Self::load_snapshot(path)?;
                info!(
                    path = %path.display(),
                    bindings = restored.bindings.len(),
                    "Restored segment state"
                );
                *pool.state.write() = restored;
            }
        }
        Ok(pool)
    }

    /// Path of the snapshot file, if any.
    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// Replaces the configured ranges for all physical networks at once.
    ///
    /// Missing in-range rows are created unallocated. Unallocated rows outside
    /// the new ranges are deleted, including those of physical networks that
    /// are no longer configured. Allocated rows are kept until released.
    #[instrument(skip(self, ranges))]
    pub fn sync_network_states(&self, ranges: &VlanRangeMap) {
        let mut state = self.state.write();
        state.sync(ranges);
        info!(
            physical_networks = ranges.len(),
            rows = state.rows.values().map(BTreeMap::len).sum::<usize>(),
            "Synchronized network VLAN ranges"
        );
    }

    /// Ranges applied by the last [`sync_network_states`](Self::sync_network_states).
    pub fn network_vlan_ranges(&self) -> VlanRangeMap {
        self.state.read().ranges.clone()
    }

    /// Reserves the first free pool row in `(physical_network, vlan_id)` order.
    #[instrument(skip(self))]
    pub fn reserve_network(&self) -> SegmentResult<(String, u16)> {
        let (physical_network, vlan_id) = self.state.write().reserve_first(None)?;
        debug!(%physical_network, vlan_id, "Reserving VLAN from pool");
        Ok((physical_network, vlan_id))
    }

    /// Reserves an explicit id, creating a specific row when it is outside the pool.
    #[instrument(skip(self))]
    pub fn reserve_specific_network(&self, physical_network: &str, vlan_id: u16) -> SegmentResult<()> {
        self.state.write().reserve_specific(physical_network, vlan_id)?;
        debug!(physical_network, vlan_id, "Reserving specific VLAN");
        Ok(())
    }

    /// Releases an id. Rows outside every range in `ranges` for the
    /// physical network are deleted; in-range rows become free again.
    #[instrument(skip(self, ranges))]
    pub fn release_network(&self, physical_network: &str, vlan_id: u16, ranges: &VlanRangeMap) {
        if self.state.write().release(physical_network, vlan_id, ranges) {
            debug!(physical_network, vlan_id, "Released VLAN");
        } else {
            warn!(physical_network, vlan_id, "VLAN to release not found");
        }
    }

    /// Returns the row for `(physical_network, vlan_id)` if one exists.
    pub fn get_network_state(
        &self,
        physical_network: &str,
        vlan_id: u16,
    ) -> Option<SegmentationIdAllocation> {
        self.state
            .read()
            .row(physical_network, vlan_id)
            .map(|allocated| SegmentationIdAllocation {
                physical_network: physical_network.to_string(),
                segmentation_id: vlan_id,
                allocated,
            })
    }

    /// Records a binding for `network_id`. An existing binding is kept.
    pub fn add_network_binding(
        &self,
        network_id: &str,
        network_type: NetworkType,
        physical_network: &str,
        segmentation_id: u16,
    ) -> NetworkBinding {
        let mut state = self.state.write();
        state
            .bindings
            .entry(network_id.to_string())
            .or_insert_with(|| NetworkBinding {
                network_id: network_id.to_string(),
                network_type,
                physical_network: physical_network.to_string(),
                segmentation_id,
            })
            .clone()
    }

    pub fn get_network_binding(&self, network_id: &str) -> Option<NetworkBinding> {
        self.state.read().bindings.get(network_id).cloned()
    }

    /// Returns the binding for `network_id`, reserving and binding a segment
    /// if the network is not bound yet.
    #[instrument(skip(self))]
    pub fn provision_network(
        &self,
        network_id: &str,
        request: &ProvisionRequest,
    ) -> SegmentResult<NetworkBinding> {
        let mut state = self.state.write();
        if let Some(binding) = state.bindings.get(network_id) {
            return Ok(binding.clone());
        }

        let (physical_network, segmentation_id) =
            match (&request.physical_network, request.segmentation_id) {
                (Some(net), Some(vlan_id)) => {
                    state.reserve_specific(net, vlan_id)?;
                    (net.clone(), vlan_id)
                }
                (Some(net), None) => {
                    if !state.ranges.contains_key(net) {
                        return Err(SegmentError::invalid_request(
                            network_id,
                            format!("unknown physical network {}", net),
                        ));
                    }
                    state.reserve_first(Some(net))?
                }
                (None, Some(_)) => {
                    return Err(SegmentError::invalid_request(
                        network_id,
                        "segmentation id requires a physical network",
                    ));
                }
                (None, None) => state.reserve_first(None)?,
            };

        let binding = NetworkBinding {
            network_id: network_id.to_string(),
            network_type: request.network_type,
            physical_network,
            segmentation_id,
        };
        state
            .bindings
            .insert(network_id.to_string(), binding.clone());

        info!(
            network_id,
            network_type = %binding.network_type,
            physical_network = %binding.physical_network,
            segmentation_id,
            "Provisioned network"
        );
        Ok(binding)
    }

    /// Releases the segment bound to `network_id` and drops the binding.
    #[instrument(skip(self))]
    pub fn release_network_binding(&self, network_id: &str) -> Option<NetworkBinding> {
        let mut state = self.state.write();
        let binding = state.bindings.remove(network_id)?;
        let ranges = state.ranges.clone();
        state.release(&binding.physical_network, binding.segmentation_id, &ranges);
        info!(
            network_id,
            physical_network = %binding.physical_network,
            segmentation_id = binding.segmentation_id,
            "Released network"
        );
        Some(binding)
    }

    /// Writes the current state to the snapshot file.
    pub fn save(&self) -> SegmentResult<()> {
        let Some(path) = self.state_file.as_deref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SegmentError::persistence(
                    path.display().to_string(),
                    format!("failed to create state directory: {}", e),
                )
            })?;
        }

        let json = serde_json::to_string_pretty(&*self.state.read()).map_err(|e| {
            SegmentError::persistence(path.display().to_string(), format!("serialize: {}", e))
        })?;
        fs::write(path, json)
            .map_err(|e| SegmentError::persistence(path.display().to_string(), e.to_string()))?;

        debug!(path = %path.display(), "Saved segment state");
        Ok(())
    }

    fn load_snapshot(path: &Path) -> SegmentResult<PoolState> {
        let json = fs::read_to_string(path)
            .map_err(|e| SegmentError::persistence(path.display().to_string(), e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| {
            SegmentError::persistence(path.display().to_string(), format!("deserialize: {}", e))
        })
    }
}
