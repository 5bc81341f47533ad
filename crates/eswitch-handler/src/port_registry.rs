//! Per-fabric port and vNIC state

use std::collections::{BTreeMap, HashMap};

use eswitch_types::{DeviceType, MacAddress, VlanTag};
use tracing::{debug, warn};

/// vNIC bound to a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnicBinding {
    pub mac: MacAddress,
    pub port_name: String,
    /// Control-plane device owning the vNIC, if known
    pub device_id: Option<String>,
    /// VLAN last programmed successfully
    pub vlan: Option<VlanTag>,
}

/// A port of the eSwitch, one per device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub dev: String,
    pub port_type: DeviceType,
    pub vnic: Option<VnicBinding>,
}

/// Ports of one fabric
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    ports: BTreeMap<String, PortEntry>,
    macs: HashMap<MacAddress, String>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a port for `dev`. Existing ports are left untouched.
    pub fn create_port(&mut self, dev: &str, port_type: DeviceType) {
        self.ports.entry(dev.to_string()).or_insert_with(|| PortEntry {
            dev: dev.to_string(),
            port_type,
            vnic: None,
        });
    }

    /// Binds `vnic_mac` to the port of `port_name`.
    ///
    /// Fails if the port is unknown, already bound to another MAC, or the MAC
    /// is bound to another port. Re-attaching the same MAC succeeds.
    pub fn attach_vnic(
        &mut self,
        port_name: &str,
        device_id: Option<&str>,
        vnic_mac: MacAddress,
    ) -> bool {
        if let Some(bound) = self.macs.get(&vnic_mac) {
            if bound != port_name {
                warn!(mac = %vnic_mac, dev = %bound, "vNIC already attached to another device");
                return false;
            }
        }

        let Some(port) = self.ports.get_mut(port_name) else {
            warn!(dev = port_name, "No port for device");
            return false;
        };

        match &mut port.vnic {
            Some(vnic) if vnic.mac != vnic_mac => {
                warn!(dev = port_name, mac = %vnic.mac, "Device already attached to another vNIC");
                return false;
            }
            Some(vnic) => {
                if let Some(id) = device_id {
                    vnic.device_id = Some(id.to_string());
                }
            }
            None => {
                port.vnic = Some(VnicBinding {
                    mac: vnic_mac,
                    port_name: port_name.to_string(),
                    device_id: device_id.map(str::to_string),
                    vlan: None,
                });
            }
        }

        self.macs.insert(vnic_mac, port_name.to_string());
        debug!(dev = port_name, mac = %vnic_mac, "Attached vNIC");
        true
    }

    /// Unbinds `vnic_mac`, returning the device it was bound to
    pub fn detach_vnic(&mut self, vnic_mac: MacAddress) -> Option<String> {
        let dev = self.macs.remove(&vnic_mac)?;
        if let Some(port) = self.ports.get_mut(&dev) {
            port.vnic = None;
        }
        debug!(dev = %dev, mac = %vnic_mac, "Detached vNIC");
        Some(dev)
    }

    pub fn get_dev_for_vnic(&self, vnic_mac: MacAddress) -> Option<&str> {
        self.macs.get(&vnic_mac).map(String::as_str)
    }

    pub fn get_port_type(&self, dev: &str) -> Option<DeviceType> {
        self.ports.get(dev).map(|p| p.port_type)
    }

    /// Device type behind the port of `dev`
    pub fn get_dev_type(&self, dev: &str) -> Option<DeviceType> {
        self.get_port_type(dev)
    }

    /// Attached vNICs as `mac -> port name`
    pub fn get_attached_vnics(&self) -> BTreeMap<MacAddress, String> {
        self.ports
            .values()
            .filter_map(|p| p.vnic.as_ref())
            .map(|v| (v.mac, v.port_name.clone()))
            .collect()
    }

    /// Records the VLAN applied to the port bound to `vnic_mac`
    pub fn set_vlan(&mut self, vnic_mac: MacAddress, vlan: VlanTag) -> bool {
        match self.vnic_mut(vnic_mac) {
            Some(vnic) => {
                vnic.vlan = Some(vlan);
                true
            }
            None => false,
        }
    }

    pub fn get_vlan(&self, vnic_mac: MacAddress) -> Option<VlanTag> {
        let dev = self.macs.get(&vnic_mac)?;
        self.ports.get(dev)?.vnic.as_ref()?.vlan
    }

    pub fn get_port(&self, dev: &str) -> Option<&PortEntry> {
        self.ports.get(dev)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    fn vnic_mut(&mut self, vnic_mac: MacAddress) -> Option<&mut VnicBinding> {
        let dev = self.macs.get(&vnic_mac)?;
        self.ports.get_mut(dev)?.vnic.as_mut()
    }
}
