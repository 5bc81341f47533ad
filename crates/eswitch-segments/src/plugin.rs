//! Control-plane side of the agent queries.
//!
//! [`PluginCallbacks`] keeps the port records of the control plane and answers
//! the two questions an agent asks about a device: what it should be bound to
//! (`get_device_details`) and that it disappeared (`update_device_down`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use eswitch_types::{MacAddress, NetworkType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::vlan_pool::VlanPool;

/// Length of the tap device prefix used by bridge agents (`tap` + port id).
pub const TAP_PREFIX_LEN: usize = 3;

/// Port status as reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortStatus {
    Active,
    Down,
    Build,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortStatus::Active => write!(f, "ACTIVE"),
            PortStatus::Down => write!(f, "DOWN"),
            PortStatus::Build => write!(f, "BUILD"),
        }
    }
}

/// A control-plane port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub id: String,
    pub mac_address: MacAddress,
    pub network_id: String,
    pub admin_state_up: bool,
    pub status: PortStatus,
}

impl PortRecord {
    /// Creates a port in `BUILD` state with admin state up.
    pub fn new(id: impl Into<String>, mac_address: MacAddress, network_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mac_address,
            network_id: network_id.into(),
            admin_state_up: true,
            status: PortStatus::Build,
        }
    }
}

/// Binding information returned for a known device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDetails {
    pub physical_network: String,
    pub network_type: NetworkType,
    pub vlan_id: u16,
    pub network_id: String,
    pub port_mac: MacAddress,
    pub port_id: String,
    pub admin_state_up: bool,
}

/// Reply to a device details query. `port` is `None` for unknown devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub device: String,
    #[serde(flatten)]
    pub port: Option<PortDetails>,
}

impl DeviceDetails {
    /// A reply for a device the control plane does not know.
    pub fn unknown(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            port: None,
        }
    }

    pub fn port_id(&self) -> Option<&str> {
        self.port.as_ref().map(|p| p.port_id.as_str())
    }
}

/// Reply to a device down report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDownReply {
    pub device: String,
    pub exists: bool,
}

/// Port records plus the segment pool they are bound through.
pub struct PluginCallbacks {
    pool: Arc<VlanPool>,
    ports: RwLock<BTreeMap<String, PortRecord>>,
}

impl PluginCallbacks {
    pub fn new(pool: Arc<VlanPool>) -> Self {
        Self {
            pool,
            ports: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<VlanPool> {
        &self.pool
    }

    /// Adds or replaces a port record.
    pub fn upsert_port(&self, port: PortRecord) {
        debug!(port_id = %port.id, mac = %port.mac_address, "Storing port");
        self.ports.write().insert(port.id.clone(), port);
    }

    pub fn get_port(&self, port_id: &str) -> Option<PortRecord> {
        self.ports.read().get(port_id).cloned()
    }

    pub fn set_port_status(&self, port_id: &str, status: PortStatus) -> bool {
        match self.ports.write().get_mut(port_id) {
            Some(port) => {
                port.status = status;
                true
            }
            None => false,
        }
    }

    /// Finds the port whose id starts with `prefix`.
    fn port_by_id_prefix(&self, prefix: &str) -> Option<PortRecord> {
        if prefix.is_empty() {
            return None;
        }
        self.ports
            .read()
            .values()
            .find(|p| p.id.starts_with(prefix))
            .cloned()
    }

    fn port_by_mac(&self, mac: &MacAddress) -> Option<PortRecord> {
        self.ports
            .read()
            .values()
            .find(|p| &p.mac_address == mac)
            .cloned()
    }

    /// Resolves a device name either as a tap device (`tap<port id prefix>`)
    /// or as a MAC address.
    pub fn get_port_from_device(&self, device: &str) -> Option<PortRecord> {
        device
            .get(TAP_PREFIX_LEN..)
            .and_then(|rest| self.port_by_id_prefix(rest))
            .or_else(|| {
                device
                    .parse::<MacAddress>()
                    .ok()
                    .and_then(|mac| self.port_by_mac(&mac))
            })
    }

    /// Returns the binding details of `device` and marks its port `ACTIVE`.
    pub fn get_device_details(&self, device: &str, agent_id: &str) -> DeviceDetails {
        debug!(device, agent_id, "Device details requested");

        let Some(port) = self.get_port_from_device(device) else {
            debug!(device, "Device not found in port records");
            return DeviceDetails::unknown(device);
        };

        let Some(binding) = self.pool.get_network_binding(&port.network_id) else {
            warn!(
                device,
                port_id = %port.id,
                network_id = %port.network_id,
                "Port has no network binding"
            );
            return DeviceDetails::unknown(device);
        };

        self.set_port_status(&port.id, PortStatus::Active);
        info!(device, port_id = %port.id, agent_id, "Port status set to ACTIVE");

        DeviceDetails {
            device: device.to_string(),
            port: Some(PortDetails {
                physical_network: binding.physical_network,
                network_type: NetworkType::Vlan,
                vlan_id: binding.segmentation_id,
                network_id: port.network_id,
                port_mac: port.mac_address,
                port_id: port.id,
                admin_state_up: port.admin_state_up,
            }),
        }
    }

    /// Records that `device` (a port id) is gone from the agent and marks
    /// its port `DOWN`.
    pub fn update_device_down(&self, device: &str, agent_id: &str) -> DeviceDownReply {
        debug!(device, agent_id, "Device no longer exists on agent");

        let exists = match self.port_by_id_prefix(device) {
            Some(port) => {
                self.set_port_status(&port.id, PortStatus::Down);
                true
            }
            None => {
                debug!(device, "Device not found in port records");
                false
            }
        };

        DeviceDownReply {
            device: device.to_string(),
            exists,
        }
    }
}

impl fmt::Debug for PluginCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCallbacks")
            .field("ports", &self.ports.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PORT_ID: &str = "3b1a7c2e-5d4f-4c1e-9a0b-1234567890ab";
    const NETWORK_ID: &str = "abcdefghijklmnopqrstuvwxyz";

    fn mac() -> MacAddress {
        "fa:16:3e:00:00:01".parse().unwrap()
    }

    fn setup() -> PluginCallbacks {
        let pool = Arc::new(VlanPool::new());
        pool.add_network_binding(NETWORK_ID, NetworkType::Vlan, "physnet1", 1234);
        let callbacks = PluginCallbacks::new(pool);
        callbacks.upsert_port(PortRecord::new(PORT_ID, mac(), NETWORK_ID));
        callbacks
    }

    #[test]
    fn test_lookup_by_tap_name_and_mac() {
        let callbacks = setup();

        let by_tap = callbacks.get_port_from_device("tap3b1a7c2e-5d").unwrap();
        assert_eq!(by_tap.id, PORT_ID);

        let by_mac = callbacks.get_port_from_device("fa:16:3e:00:00:01").unwrap();
        assert_eq!(by_mac.id, PORT_ID);

        assert!(callbacks.get_port_from_device("tapffff").is_none());
        assert!(callbacks.get_port_from_device("ta").is_none());
    }

    #[test]
    fn test_get_device_details_known() {
        let callbacks = setup();
        let details = callbacks.get_device_details("fa:16:3e:00:00:01", "agent-1");

        assert_eq!(
            details.port,
            Some(PortDetails {
                physical_network: "physnet1".to_string(),
                network_type: NetworkType::Vlan,
                vlan_id: 1234,
                network_id: NETWORK_ID.to_string(),
                port_mac: mac(),
                port_id: PORT_ID.to_string(),
                admin_state_up: true,
            })
        );
        assert_eq!(callbacks.get_port(PORT_ID).unwrap().status, PortStatus::Active);
    }

    #[test]
    fn test_get_device_details_unknown() {
        let callbacks = setup();
        let details = callbacks.get_device_details("fa:16:3e:00:00:99", "agent-1");
        assert_eq!(details, DeviceDetails::unknown("fa:16:3e:00:00:99"));
        assert!(details.port_id().is_none());
    }

    #[test]
    fn test_update_device_down() {
        let callbacks = setup();

        let reply = callbacks.update_device_down(PORT_ID, "agent-1");
        assert!(reply.exists);
        assert_eq!(callbacks.get_port(PORT_ID).unwrap().status, PortStatus::Down);

        assert!(!callbacks.update_device_down("missing", "agent-1").exists);
    }

    #[test]
    fn test_details_serialize_flat() {
        let callbacks = setup();
        let details = callbacks.get_device_details("fa:16:3e:00:00:01", "agent-1");
        let json = serde_json::to_value(&details).unwrap();

        assert_eq!(json["device"], "fa:16:3e:00:00:01");
        assert_eq!(json["vlan_id"], 1234);
        assert_eq!(json["network_type"], "vlan");
    }
}
