//! EswitchAgent - the reconciliation loop
//!
//! Each tick scans the attached devices, diffs them against the last adopted
//! snapshot and treats removed then added devices. A control-plane or
//! hardware failure flags a resync: the snapshot is not adopted and the next
//! tick starts from an empty known set.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use eswitch_handler::{diff_devices, DeviceDiff, ScannedDevice};
use eswitch_types::MacAddress;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::AgentResult;
use crate::manager::EswitchManager;
use crate::notifications::AgentNotification;
use crate::rpc::{PluginApi, PortDetails};

/// Where the loop is within a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopPhase {
    Idle,
    Diffing,
    Applying,
    Succeeded,
    Failed,
    ResyncFlagged,
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No device appeared or disappeared
    Unchanged,
    /// Differences applied and the snapshot adopted
    Applied { added: usize, removed: usize },
    /// A control-plane or hardware call failed; the snapshot was not adopted
    ResyncNeeded,
    /// An error escaped the tick
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub ticks: u64,
    pub resyncs: u64,
    pub devices_added: u64,
    pub devices_removed: u64,
    pub notifications: u64,
    pub overruns: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

pub struct EswitchAgent {
    manager: EswitchManager,
    plugin: Arc<dyn PluginApi>,
    agent_id: String,
    polling_interval: Duration,
    sync: bool,
    known: BTreeMap<String, ScannedDevice>,
    phase: LoopPhase,
    stats: AgentStats,
}

impl EswitchAgent {
    pub fn new(
        manager: EswitchManager,
        plugin: Arc<dyn PluginApi>,
        agent_id: impl Into<String>,
        polling_interval: Duration,
    ) -> Self {
        Self {
            manager,
            plugin,
            agent_id: agent_id.into(),
            polling_interval,
            sync: true,
            known: BTreeMap::new(),
            phase: LoopPhase::Idle,
            stats: AgentStats::default(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn manager(&self) -> &EswitchManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut EswitchManager {
        &mut self.manager
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    /// True when the next tick starts from an empty known set
    pub fn needs_resync(&self) -> bool {
        self.sync
    }

    /// Devices of the last adopted snapshot
    pub fn known_devices(&self) -> &BTreeMap<String, ScannedDevice> {
        &self.known
    }

    /// Runs one reconciliation pass
    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub async fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;
        self.stats.last_tick = Some(Utc::now());

        match self.process_devices().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Error in agent event loop");
                self.phase = LoopPhase::Failed;
                self.flag_resync();
                TickOutcome::Failed
            }
        }
    }

    async fn process_devices(&mut self) -> AgentResult<TickOutcome> {
        if self.sync {
            info!("Agent out of sync with plugin");
            self.known.clear();
            self.sync = false;
        }

        self.phase = LoopPhase::Diffing;
        let snapshot = self
            .manager
            .handler()
            .scan_attached_devices()
            .await?
            .snapshot();
        let diff = self.compute_diff(&snapshot);

        if diff.is_empty() {
            self.adopt(snapshot);
            self.phase = LoopPhase::Succeeded;
            return Ok(TickOutcome::Unchanged);
        }

        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Agent loop has new devices"
        );
        self.phase = LoopPhase::Applying;
        let resync_removed = self.treat_devices_removed(&diff.removed).await;
        let resync_added = self.treat_devices_added(&diff.added).await;
        self.stats.devices_removed += diff.removed.len() as u64;
        self.stats.devices_added += diff.added.len() as u64;

        if resync_removed || resync_added {
            warn!("Control plane or hardware call failed, resync on next tick");
            self.flag_resync();
            return Ok(TickOutcome::ResyncNeeded);
        }

        self.adopt(snapshot);
        self.phase = LoopPhase::Succeeded;
        Ok(TickOutcome::Applied {
            added: diff.added.len(),
            removed: diff.removed.len(),
        })
    }

    /// Diff against the known set. Devices the handler still holds but the
    /// scan no longer shows count as removed, so departures during a resync
    /// are not lost.
    fn compute_diff(&self, snapshot: &BTreeMap<String, ScannedDevice>) -> DeviceDiff {
        let mut diff = diff_devices(&self.known, snapshot);

        for (dev, held) in self.manager.handler().attached_devices() {
            let gone = snapshot.get(dev).map(|d| d.mac) != Some(held.mac);
            if gone && !diff.removed.iter().any(|d| &d.dev == dev) {
                diff.removed.push(held.clone());
            }
        }
        diff
    }

    /// Makes `snapshot` the known set, leaving out devices the handler
    /// refused so they are tried again on the next tick. Devices without a
    /// fabric or MAC can never bind and are kept.
    fn adopt(&mut self, snapshot: BTreeMap<String, ScannedDevice>) {
        let handler = self.manager.handler();
        self.known = snapshot
            .into_iter()
            .filter(|(_, d)| d.fabric.is_none() || d.mac.is_none() || handler.is_bound(d))
            .collect();
    }

    fn flag_resync(&mut self) {
        self.sync = true;
        self.stats.resyncs += 1;
        self.phase = LoopPhase::ResyncFlagged;
    }

    /// Returns true if a control-plane or hardware call failed
    async fn treat_devices_removed(&mut self, devices: &[ScannedDevice]) -> bool {
        let mut resync = false;

        for device in devices {
            let (Some(mac), true) = (device.mac, self.manager.handler().is_bound(device)) else {
                debug!(dev = %device.dev, "Device was never bound, skipping removal");
                self.manager.handler_mut().release_device(device);
                continue;
            };
            info!(dev = %device.dev, mac = %mac, "Removing device");

            let port_id = self.manager.get_port_id_by_mac(mac);
            match self.plugin.update_device_down(&port_id, &self.agent_id).await {
                Ok(reply) => info!(port_id = %port_id, exists = reply.exists, "Port updated"),
                Err(e) => {
                    warn!(dev = %device.dev, mac = %mac, error = %e, "Removing port failed");
                    resync = true;
                    continue;
                }
            }

            if let Err(e) = self.manager.port_release(mac).await {
                warn!(dev = %device.dev, mac = %mac, error = %e, "Failed to clear port VLAN");
                if e.needs_resync() {
                    resync = true;
                    continue;
                }
            }
            self.manager.handler_mut().release_device(device);
        }
        resync
    }

    /// Returns true if a control-plane or hardware call failed
    async fn treat_devices_added(&mut self, devices: &[ScannedDevice]) -> bool {
        let mut resync = false;

        for device in devices {
            let Some(mac) = device.mac else {
                debug!(dev = %device.dev, "Device has no vNIC MAC");
                continue;
            };
            info!(dev = %device.dev, mac = %mac, "Adding port");

            if !self.manager.handler_mut().attach_device(device) {
                warn!(dev = %device.dev, mac = %mac, "Failed to attach device");
                continue;
            }

            let details = match self
                .plugin
                .get_device_details(&mac.to_string(), &self.agent_id)
                .await
            {
                Ok(details) => details,
                Err(e) => {
                    warn!(mac = %mac, error = %e, "Unable to get device details");
                    resync = true;
                    continue;
                }
            };

            match details.port {
                Some(port) => {
                    info!(mac = %mac, port_id = %port.port_id, "Port updated");
                    debug!(?port, "Device details");
                    if let Err(e) = self.treat_vif_port(&port).await {
                        error!(port_id = %port.port_id, mac = %mac, error = %e, "Failed to treat port");
                        resync |= e.needs_resync();
                    }
                }
                None => debug!(mac = %mac, "Device not defined on plugin"),
            }
        }
        resync
    }

    async fn treat_vif_port(&mut self, port: &PortDetails) -> AgentResult<()> {
        self.apply_port_state(
            &port.network_id,
            &port.network_type.to_string(),
            &port.physical_network,
            port.vlan_id,
            &port.port_id,
            port.port_mac,
            port.admin_state_up,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_port_state(
        &mut self,
        network_id: &str,
        network_type: &str,
        physical_network: &str,
        vlan_id: u16,
        port_id: &str,
        port_mac: MacAddress,
        admin_state_up: bool,
    ) -> AgentResult<()> {
        if !self.manager.vnic_port_exists(port_mac) {
            debug!(port_id, "No port defined on agent");
            return Ok(());
        }

        if admin_state_up {
            self.manager
                .port_up(network_id, network_type, physical_network, vlan_id, port_id, port_mac)
                .await
        } else {
            self.manager
                .port_down(network_id, physical_network, port_mac)
                .await
                .map(|_| ())
        }
    }

    /// Applies one control-plane notification
    #[instrument(skip(self, notification), fields(kind = notification.kind()))]
    pub async fn handle_notification(&mut self, notification: AgentNotification) -> AgentResult<()> {
        self.stats.notifications += 1;

        match notification {
            AgentNotification::PortUpdate {
                port,
                network_type,
                physical_network,
                vlan_id,
            } => {
                debug!(port_id = %port.id, "port_update received");
                self.apply_port_state(
                    &port.network_id,
                    &network_type,
                    &physical_network,
                    vlan_id,
                    &port.id,
                    port.mac_address,
                    port.admin_state_up,
                )
                .await
            }
            AgentNotification::NetworkDelete {
                network_id,
                physical_network,
                vlan_id,
            } => {
                let Some(network_id) = network_id else {
                    warn!("Invalid network id, cannot remove network");
                    return Ok(());
                };
                debug!(network_id = %network_id, ?physical_network, ?vlan_id, "Delete network");
                self.manager.remove_network(&network_id);
                Ok(())
            }
        }
    }

    /// Runs ticks at the polling interval and applies notifications between
    /// them until `shutdown` turns true.
    pub async fn run(
        mut self,
        mut notifications: mpsc::Receiver<AgentNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AgentStats {
        let mut interval = tokio::time::interval(self.polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            agent_id = %self.agent_id,
            polling_interval_ms = self.polling_interval.as_millis() as u64,
            "Agent loop started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, leaving agent loop");
                        break;
                    }
                }
                _ = interval.tick() => {
                    let started = Instant::now();
                    self.tick().await;
                    let elapsed = started.elapsed();
                    if elapsed > self.polling_interval {
                        self.stats.overruns += 1;
                        debug!(
                            polling_interval_ms = self.polling_interval.as_millis() as u64,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Loop iteration exceeded interval"
                        );
                    }
                }
                Some(notification) = notifications.recv() => {
                    let kind = notification.kind();
                    if let Err(e) = self.handle_notification(notification).await {
                        error!(kind, error = %e, "Failed to handle notification");
                    }
                }
            }
        }

        self.phase = LoopPhase::Idle;
        info!(ticks = self.stats.ticks, resyncs = self.stats.resyncs, "Agent loop stopped");
        self.stats
    }
}

impl std::fmt::Debug for EswitchAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EswitchAgent")
            .field("agent_id", &self.agent_id)
            .field("phase", &self.phase)
            .field("sync", &self.sync)
            .field("known", &self.known.len())
            .finish()
    }
}
