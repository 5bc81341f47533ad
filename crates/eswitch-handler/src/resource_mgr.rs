//! Fabric and device inventory
//!
//! Each fabric owns one PF. Enumerating the PF yields one hostdev device per
//! VF (keyed by PCI address) and, for VFs bound to a network driver, one
//! direct device (keyed by netdev name). Both views of a VF share its VF index
//! and only one of them can be allocated at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use eswitch_types::{DeviceType, MacAddress};
use tracing::{debug, info, instrument, warn};

use crate::device_control::DeviceControl;
use crate::error::{EswitchError, EswitchResult};

/// A hardware-backed device owned by a fabric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub dev_type: DeviceType,
    pub vf_index: u16,
    /// Netdev used for link admin state changes; `None` when the VF has no
    /// netdev bound
    pub interface: Option<String>,
    pub allocated: bool,
}

#[derive(Debug, Clone)]
struct FabricResources {
    pf: String,
    devices: BTreeMap<String, Device>,
}

impl FabricResources {
    fn vf_in_use(&self, vf_index: u16) -> bool {
        self.devices
            .values()
            .any(|d| d.allocated && d.vf_index == vf_index)
    }

    fn free_devices(&self, dev_type: DeviceType) -> Vec<&Device> {
        let mut free: Vec<&Device> = self
            .devices
            .values()
            .filter(|d| d.dev_type == dev_type && !self.vf_in_use(d.vf_index))
            .collect();
        free.sort_by_key(|d| d.vf_index);
        free
    }
}

/// One attached device as seen by a hardware scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub dev: String,
    pub dev_type: DeviceType,
    pub mac: Option<MacAddress>,
    /// Fabric owning the device, if it belongs to a mapped PF
    pub fabric: Option<String>,
}

/// Result of [`ResourceManager::scan_attached_devices`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachedDevices {
    pub direct: Vec<ScannedDevice>,
    pub hostdev: Vec<ScannedDevice>,
}

impl AttachedDevices {
    /// All scanned devices keyed by device name
    pub fn snapshot(&self) -> BTreeMap<String, ScannedDevice> {
        self.direct
            .iter()
            .chain(self.hostdev.iter())
            .map(|d| (d.dev.clone(), d.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.direct.len() + self.hostdev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.hostdev.is_empty()
    }
}

/// Owns fabrics and their devices
pub struct ResourceManager {
    control: Arc<dyn DeviceControl>,
    fabrics: BTreeMap<String, FabricResources>,
    /// PF -> fabric
    pf_index: HashMap<String, String>,
    /// device -> fabric
    dev_index: HashMap<String, String>,
}

impl ResourceManager {
    pub fn new(control: Arc<dyn DeviceControl>) -> Self {
        Self {
            control,
            fabrics: BTreeMap::new(),
            pf_index: HashMap::new(),
            dev_index: HashMap::new(),
        }
    }

    pub fn control(&self) -> &Arc<dyn DeviceControl> {
        &self.control
    }

    /// Registers a fabric and enumerates the VFs of its PF
    #[instrument(skip(self))]
    pub async fn add_fabric(&mut self, fabric: &str, pf: &str) -> EswitchResult<()> {
        if self.fabrics.contains_key(fabric) {
            return Err(EswitchError::config(format!(
                "fabric {} is already mapped",
                fabric
            )));
        }
        if let Some(owner) = self.pf_index.get(pf) {
            return Err(EswitchError::config(format!(
                "PF {} is already mapped to fabric {}",
                pf, owner
            )));
        }

        let vfs = self
            .control
            .list_vfs(pf)
            .await
            .map_err(|e| EswitchError::hardware(pf, e))?;

        let mut devices = BTreeMap::new();
        for vf in &vfs {
            devices.insert(
                vf.pci_address.clone(),
                Device {
                    name: vf.pci_address.clone(),
                    dev_type: DeviceType::Hostdev,
                    vf_index: vf.vf_index,
                    interface: vf.netdev.clone(),
                    allocated: false,
                },
            );
            if let Some(netdev) = &vf.netdev {
                devices.insert(
                    netdev.clone(),
                    Device {
                        name: netdev.clone(),
                        dev_type: DeviceType::Direct,
                        vf_index: vf.vf_index,
                        interface: Some(netdev.clone()),
                        allocated: false,
                    },
                );
            }
        }

        for dev in devices.keys() {
            self.dev_index.insert(dev.clone(), fabric.to_string());
        }
        self.pf_index.insert(pf.to_string(), fabric.to_string());
        self.fabrics.insert(
            fabric.to_string(),
            FabricResources {
                pf: pf.to_string(),
                devices,
            },
        );

        info!(fabric, pf, vfs = vfs.len(), "Added fabric");
        Ok(())
    }

    /// Names of the mapped fabrics
    pub fn fabrics(&self) -> Vec<String> {
        self.fabrics.keys().cloned().collect()
    }

    /// PFs of all mapped fabrics
    pub fn pfs(&self) -> Vec<String> {
        self.fabrics.values().map(|f| f.pf.clone()).collect()
    }

    /// Lists devices currently attached to a vNIC, with their fabric
    pub async fn scan_attached_devices(&self) -> EswitchResult<AttachedDevices> {
        let pfs = self.pfs();
        let attached = self
            .control
            .list_attached(&pfs)
            .await
            .map_err(|e| EswitchError::hardware(pfs.join(","), e))?;

        let mut result = AttachedDevices::default();
        for device in attached {
            let scanned = ScannedDevice {
                fabric: self.dev_index.get(&device.dev).cloned(),
                dev: device.dev,
                dev_type: device.dev_type,
                mac: device.mac,
            };
            match scanned.dev_type {
                DeviceType::Direct => result.direct.push(scanned),
                DeviceType::Hostdev => result.hostdev.push(scanned),
            }
        }

        debug!(
            direct = result.direct.len(),
            hostdev = result.hostdev.len(),
            "Scanned attached devices"
        );
        Ok(result)
    }

    /// Allocates `dev`, or the free device of `dev_type` with the lowest VF
    /// index when `dev` is `None`. Returns `None` when nothing is free.
    #[instrument(skip(self))]
    pub fn allocate_device(
        &mut self,
        fabric: &str,
        dev_type: DeviceType,
        dev: Option<&str>,
    ) -> Option<String> {
        let resources = self.fabrics.get_mut(fabric)?;

        let name = match dev {
            Some(dev) => {
                let device = resources.devices.get(dev)?;
                if device.dev_type != dev_type || resources.vf_in_use(device.vf_index) {
                    debug!(fabric, dev, "Requested device is not free");
                    return None;
                }
                dev.to_string()
            }
            None => match resources.free_devices(dev_type).first() {
                Some(device) => device.name.clone(),
                None => {
                    warn!(fabric, %dev_type, "No free device available");
                    return None;
                }
            },
        };

        let device = resources.devices.get_mut(&name)?;
        device.allocated = true;
        debug!(fabric, dev = %name, "Allocated device");
        Some(name)
    }

    /// Returns a device to the free pool. Releasing a free or unknown device
    /// is a no-op.
    #[instrument(skip(self))]
    pub fn deallocate_device(&mut self, fabric: &str, dev_type: DeviceType, dev: &str) -> bool {
        let Some(device) = self
            .fabrics
            .get_mut(fabric)
            .and_then(|f| f.devices.get_mut(dev))
        else {
            debug!(fabric, dev, "Device to deallocate not found");
            return false;
        };
        if device.dev_type != dev_type {
            warn!(fabric, dev, %dev_type, "Device type mismatch on deallocate");
            return false;
        }
        let was_allocated = device.allocated;
        device.allocated = false;
        was_allocated
    }

    /// Fabric owning `dev`, where `dev` is a device or a PF
    pub fn get_fabric_for_dev(&self, dev: &str) -> Option<&str> {
        self.dev_index
            .get(dev)
            .or_else(|| self.pf_index.get(dev))
            .map(String::as_str)
    }

    pub fn get_fabric_pf(&self, fabric: &str) -> Option<&str> {
        self.fabrics.get(fabric).map(|f| f.pf.as_str())
    }

    pub fn get_device(&self, dev: &str) -> Option<&Device> {
        let fabric = self.dev_index.get(dev)?;
        self.fabrics.get(fabric)?.devices.get(dev)
    }

    pub fn get_vf_index(&self, dev: &str) -> Option<u16> {
        self.get_device(dev).map(|d| d.vf_index)
    }

    /// Free hostdev devices, lowest VF index first
    pub fn get_free_vfs(&self, fabric: &str) -> Vec<String> {
        self.free_names(fabric, DeviceType::Hostdev)
    }

    /// Free direct devices, lowest VF index first
    pub fn get_free_eths(&self, fabric: &str) -> Vec<String> {
        self.free_names(fabric, DeviceType::Direct)
    }

    /// All devices of a fabric
    pub fn devices(&self, fabric: &str) -> Vec<&Device> {
        self.fabrics
            .get(fabric)
            .map(|f| f.devices.values().collect())
            .unwrap_or_default()
    }

    fn free_names(&self, fabric: &str, dev_type: DeviceType) -> Vec<String> {
        self.fabrics
            .get(fabric)
            .map(|f| {
                f.free_devices(dev_type)
                    .into_iter()
                    .map(|d| d.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("fabrics", &self.fabrics)
            .finish()
    }
}
