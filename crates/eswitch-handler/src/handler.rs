//! EswitchHandler - port-level orchestration over all fabrics
//!
//! Request flow:
//! 1. `create_port` / `delete_port` → ResourceManager allocation + PortRegistry binding
//! 2. `set_vlan` / `port_release` → PortRegistry lookup + DeviceControl link/VF sequence
//! 3. `sync_devices` → hardware scan diffed against the last adopted scan

use std::collections::BTreeMap;
use std::sync::Arc;

use eswitch_types::{DeviceType, MacAddress, VlanTag};
use tracing::{debug, error, info, instrument, warn};

use crate::commands::DEFAULT_VLAN_QOS;
use crate::device_control::DeviceControl;
use crate::diff::{diff_devices, DeviceDiff};
use crate::error::{EswitchError, EswitchResult};
use crate::port_registry::PortRegistry;
use crate::resource_mgr::{AttachedDevices, ResourceManager, ScannedDevice};

/// Owns the resource inventory and one port registry per fabric
pub struct EswitchHandler {
    resources: ResourceManager,
    eswitches: BTreeMap<String, PortRegistry>,
    /// Attached devices adopted from the last scan or attach
    devices: BTreeMap<String, ScannedDevice>,
}

impl EswitchHandler {
    pub fn new(control: Arc<dyn DeviceControl>) -> Self {
        Self {
            resources: ResourceManager::new(control),
            eswitches: BTreeMap::new(),
            devices: BTreeMap::new(),
        }
    }

    /// Maps each `(fabric, pf)` pair, then runs one device sync pass
    pub async fn add_fabrics(&mut self, fabrics: &[(String, String)]) -> EswitchResult<()> {
        for (fabric, pf) in fabrics {
            self.add_fabric(fabric, pf).await?;
        }
        self.sync_devices().await?;
        Ok(())
    }

    async fn add_fabric(&mut self, fabric: &str, pf: &str) -> EswitchResult<()> {
        self.resources.add_fabric(fabric, pf).await?;

        let mut registry = PortRegistry::new();
        for vf in self.resources.get_free_vfs(fabric) {
            registry.create_port(&vf, DeviceType::Hostdev);
        }
        for eth in self.resources.get_free_eths(fabric) {
            registry.create_port(&eth, DeviceType::Direct);
        }
        debug!(fabric, ports = registry.len(), "Created eSwitch ports");
        self.eswitches.insert(fabric.to_string(), registry);
        Ok(())
    }

    /// Maps `fabric` to `interface` unless the interface is already mapped
    #[instrument(skip(self))]
    pub async fn set_fabric_mapping(
        &mut self,
        fabric: &str,
        interface: &str,
    ) -> EswitchResult<(String, String)> {
        if self.resources.get_fabric_for_dev(interface).is_none() {
            self.add_fabrics(&[(fabric.to_string(), interface.to_string())])
                .await?;
        }
        Ok((fabric.to_string(), interface.to_string()))
    }

    pub fn fabrics(&self) -> Vec<String> {
        self.eswitches.keys().cloned().collect()
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn registry(&self, fabric: &str) -> Option<&PortRegistry> {
        self.eswitches.get(fabric)
    }

    /// Devices adopted from the last scan or attach, by device name
    pub fn attached_devices(&self) -> &BTreeMap<String, ScannedDevice> {
        &self.devices
    }

    /// Attached vNICs of the given fabrics as `mac -> port name`
    pub fn get_vnics(&self, fabrics: &[String]) -> BTreeMap<MacAddress, String> {
        let mut vnics = BTreeMap::new();
        for fabric in fabrics {
            match self.eswitches.get(fabric) {
                Some(eswitch) => vnics.extend(eswitch.get_attached_vnics()),
                None => error!(fabric = %fabric, "No eSwitch found for fabric"),
            }
        }
        debug!(count = vnics.len(), "Collected attached vNICs");
        vnics
    }

    /// Allocates a device of `vnic_type` and binds `vnic_mac` to it.
    ///
    /// Returns the device already bound to `vnic_mac` if there is one. The
    /// allocation is rolled back if the bind fails.
    #[instrument(skip(self))]
    pub fn create_port(
        &mut self,
        fabric: &str,
        vnic_type: DeviceType,
        device_id: Option<&str>,
        vnic_mac: MacAddress,
    ) -> Option<String> {
        let Some(eswitch) = self.eswitches.get_mut(fabric) else {
            error!(fabric, "No eSwitch found for fabric");
            return None;
        };

        if let Some(dev) = eswitch.get_dev_for_vnic(vnic_mac) {
            return Some(dev.to_string());
        }

        let dev = self.resources.allocate_device(fabric, vnic_type, None)?;
        if !eswitch.attach_vnic(&dev, device_id, vnic_mac) {
            self.resources.deallocate_device(fabric, vnic_type, &dev);
            warn!(fabric, dev = %dev, mac = %vnic_mac, "Attach failed, device released");
            return None;
        }

        info!(fabric, dev = %dev, mac = %vnic_mac, "Created port");
        Some(dev)
    }

    /// Unbinds `vnic_mac` and frees its device
    #[instrument(skip(self))]
    pub fn delete_port(&mut self, fabric: &str, vnic_mac: MacAddress) -> Option<String> {
        let Some(eswitch) = self.eswitches.get_mut(fabric) else {
            error!(fabric, "No eSwitch found for fabric");
            return None;
        };

        let dev = eswitch.detach_vnic(vnic_mac)?;
        if let Some(dev_type) = eswitch.get_dev_type(&dev) {
            self.resources.deallocate_device(fabric, dev_type, &dev);
        }
        info!(fabric, dev = %dev, mac = %vnic_mac, "Deleted port");
        Some(dev)
    }

    /// Programs `vlan` on the VF bound to `vnic_mac`: link down, VF VLAN with
    /// priority 0, link up.
    ///
    /// Nothing is sent to the hardware when the vNIC, PF or VF index cannot be
    /// resolved. A failing command aborts the sequence without rollback. The
    /// VLAN is recorded only after the whole sequence succeeds.
    #[instrument(skip(self))]
    pub async fn set_vlan(
        &mut self,
        fabric: &str,
        vnic_mac: MacAddress,
        vlan: VlanTag,
    ) -> EswitchResult<()> {
        let eswitch = self
            .eswitches
            .get(fabric)
            .ok_or_else(|| EswitchError::unknown_fabric(fabric))?;
        let dev = eswitch
            .get_dev_for_vnic(vnic_mac)
            .ok_or_else(|| EswitchError::VnicNotFound {
                fabric: fabric.to_string(),
                mac: vnic_mac,
            })?;

        let pf = self.resources.get_fabric_pf(fabric);
        let device = self.resources.get_device(dev);
        let (Some(pf), Some(device)) = (pf, device) else {
            error!(fabric, dev, "Invalid VF/PF index for device");
            return Err(EswitchError::DeviceNotFound {
                device: dev.to_string(),
            });
        };

        let Some(interface) = device.interface.clone() else {
            error!(fabric, dev, "VF has no netdev, cannot change link state");
            return Err(EswitchError::DeviceNotFound {
                device: dev.to_string(),
            });
        };
        let pf = pf.to_string();
        let vf_index = device.vf_index;

        if let Err(e) = self.config_vlan_priority(&pf, vf_index, &interface, vlan).await {
            error!(fabric, pf = %pf, vf_index, mac = %vnic_mac, error = %e, "Set VLAN operation failed");
            return Err(e);
        }

        if let Some(eswitch) = self.eswitches.get_mut(fabric) {
            eswitch.set_vlan(vnic_mac, vlan);
        }
        info!(fabric, pf = %pf, vf_index, mac = %vnic_mac, %vlan, "Set VLAN");
        Ok(())
    }

    /// Clears the VLAN of `vnic_mac`; same as `set_vlan(fabric, mac, 0)`
    pub async fn port_release(&mut self, fabric: &str, vnic_mac: MacAddress) -> EswitchResult<()> {
        self.set_vlan(fabric, vnic_mac, VlanTag::CLEAR).await
    }

    async fn config_vlan_priority(
        &self,
        pf: &str,
        vf_index: u16,
        interface: &str,
        vlan: VlanTag,
    ) -> EswitchResult<()> {
        let control = self.resources.control();

        control
            .set_link(interface, false)
            .await
            .map_err(|e| EswitchError::hardware(interface, e))?;
        control
            .set_vf_vlan(pf, vf_index, vlan, DEFAULT_VLAN_QOS)
            .await
            .map_err(|e| EswitchError::hardware(pf, e))?;
        control
            .set_link(interface, true)
            .await
            .map_err(|e| EswitchError::hardware(interface, e))?;
        Ok(())
    }

    /// Lists devices currently attached on all mapped PFs
    pub async fn scan_attached_devices(&self) -> EswitchResult<AttachedDevices> {
        self.resources.scan_attached_devices().await
    }

    /// Allocates and binds a device found attached by a scan.
    ///
    /// Devices without a fabric or MAC are skipped. A device already bound to
    /// the same MAC counts as attached.
    pub fn attach_device(&mut self, device: &ScannedDevice) -> bool {
        let (Some(fabric), Some(mac)) = (device.fabric.as_deref(), device.mac) else {
            debug!(dev = %device.dev, "No fabric defined for device");
            return false;
        };
        let Some(eswitch) = self.eswitches.get_mut(fabric) else {
            error!(fabric, "No eSwitch found for fabric");
            return false;
        };

        if eswitch.get_dev_for_vnic(mac) != Some(device.dev.as_str()) {
            if self
                .resources
                .allocate_device(fabric, device.dev_type, Some(&device.dev))
                .is_none()
            {
                warn!(fabric, dev = %device.dev, mac = %mac, "Device is not free");
                return false;
            }
            if !eswitch.attach_vnic(&device.dev, None, mac) {
                self.resources
                    .deallocate_device(fabric, device.dev_type, &device.dev);
                return false;
            }
            info!(fabric, dev = %device.dev, mac = %mac, "Attached device");
        }

        self.devices.insert(device.dev.clone(), device.clone());
        true
    }

    /// True if the MAC of `device` is bound to that very device
    pub fn is_bound(&self, device: &ScannedDevice) -> bool {
        let Some(mac) = device.mac else {
            return false;
        };
        self.resources
            .get_fabric_for_dev(&device.dev)
            .and_then(|fabric| self.eswitches.get(fabric))
            .and_then(|eswitch| eswitch.get_dev_for_vnic(mac))
            == Some(device.dev.as_str())
    }

    /// Unbinds and frees a device that disappeared from a scan.
    ///
    /// The fabric comes from the device index and the MAC from `device`, the
    /// record of the previous scan. Nothing is released unless that MAC is
    /// bound to that device.
    pub fn release_device(&mut self, device: &ScannedDevice) -> bool {
        self.devices.remove(&device.dev);

        if !self.is_bound(device) {
            debug!(dev = %device.dev, mac = ?device.mac, "Device not bound, nothing to release");
            return false;
        }
        let (Some(fabric), Some(mac)) = (
            self.resources.get_fabric_for_dev(&device.dev).map(str::to_string),
            device.mac,
        ) else {
            return false;
        };

        if let Some(eswitch) = self.eswitches.get_mut(&fabric) {
            eswitch.detach_vnic(mac);
        }
        self.resources
            .deallocate_device(&fabric, device.dev_type, &device.dev);
        info!(fabric = %fabric, dev = %device.dev, "Released device");
        true
    }

    /// Scans attached devices once and applies the difference to the
    /// adopted devices.
    ///
    /// Only devices that attach are adopted; a refused device shows up as
    /// added again on the next sync.
    #[instrument(skip(self))]
    pub async fn sync_devices(&mut self) -> EswitchResult<DeviceDiff> {
        let snapshot = self.scan_attached_devices().await?.snapshot();
        let diff = diff_devices(&self.devices, &snapshot);

        for device in &diff.removed {
            self.release_device(device);
        }
        for device in &diff.added {
            self.attach_device(device);
        }

        Ok(diff)
    }
}

impl std::fmt::Debug for EswitchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EswitchHandler")
            .field("fabrics", &self.fabrics())
            .field("devices", &self.devices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_control::{DeviceOp, RecordingControl};
    use pretty_assertions::assert_eq;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xfa, 0x16, 0x3e, 0, 0, last])
    }

    async fn handler() -> (Arc<RecordingControl>, EswitchHandler) {
        let control = Arc::new(RecordingControl::new().with_pf("eth2", "0000:03:00", 2));
        let mut handler = EswitchHandler::new(control.clone());
        handler
            .add_fabrics(&[("physnet1".to_string(), "eth2".to_string())])
            .await
            .unwrap();
        (control, handler)
    }

    #[tokio::test]
    async fn test_create_port_returns_existing() {
        let (_, mut handler) = handler().await;

        let dev = handler
            .create_port("physnet1", DeviceType::Direct, Some("vm-1"), mac(1))
            .unwrap();
        assert_eq!(dev, "eth2f0");
        assert_eq!(
            handler.create_port("physnet1", DeviceType::Direct, None, mac(1)),
            Some(dev)
        );
        assert_eq!(handler.resources().get_free_eths("physnet1"), vec!["eth2f1"]);
    }

    #[tokio::test]
    async fn test_create_port_unknown_fabric() {
        let (_, mut handler) = handler().await;
        assert_eq!(
            handler.create_port("physnet9", DeviceType::Direct, None, mac(1)),
            None
        );
    }

    #[tokio::test]
    async fn test_create_port_rolls_back_failed_attach() {
        let (_, mut handler) = handler().await;

        // Port bound in the registry while its device is still free
        handler
            .eswitches
            .get_mut("physnet1")
            .unwrap()
            .attach_vnic("eth2f0", None, mac(9));

        assert_eq!(
            handler.create_port("physnet1", DeviceType::Direct, None, mac(1)),
            None
        );
        assert_eq!(
            handler.resources().get_free_eths("physnet1"),
            vec!["eth2f0", "eth2f1"]
        );
        assert_eq!(handler.registry("physnet1").unwrap().get_dev_for_vnic(mac(1)), None);
    }

    #[tokio::test]
    async fn test_delete_port_frees_device() {
        let (_, mut handler) = handler().await;
        handler.create_port("physnet1", DeviceType::Hostdev, None, mac(1));

        assert_eq!(
            handler.delete_port("physnet1", mac(1)),
            Some("0000:03:00.1".to_string())
        );
        assert_eq!(handler.delete_port("physnet1", mac(1)), None);
        assert_eq!(handler.resources().get_free_vfs("physnet1").len(), 2);
    }

    #[tokio::test]
    async fn test_set_vlan_unresolved_sends_nothing() {
        let (control, mut handler) = handler().await;

        assert!(matches!(
            handler.set_vlan("physnet1", mac(1), VlanTag::new(5).unwrap()).await,
            Err(EswitchError::VnicNotFound { .. })
        ));
        assert!(matches!(
            handler.set_vlan("physnet9", mac(1), VlanTag::new(5).unwrap()).await,
            Err(EswitchError::UnknownFabric { .. })
        ));
        assert!(control.ops().is_empty());
    }

    #[tokio::test]
    async fn test_set_vlan_failure_not_recorded() {
        let (control, mut handler) = handler().await;
        handler.create_port("physnet1", DeviceType::Direct, None, mac(1));
        control.fail_on("eth2");

        let result = handler
            .set_vlan("physnet1", mac(1), VlanTag::new(100).unwrap())
            .await;
        assert!(matches!(result, Err(EswitchError::HardwareCommand { .. })));
        assert_eq!(handler.registry("physnet1").unwrap().get_vlan(mac(1)), None);

        // No rollback: the link stays down
        assert_eq!(
            control.ops().last(),
            Some(&DeviceOp::SetVfVlan {
                pf: "eth2".to_string(),
                vf_index: 0,
                vlan: VlanTag::new(100).unwrap(),
                qos: 0,
            })
        );
    }

    #[tokio::test]
    async fn test_sync_devices_attaches_and_releases() {
        let (control, mut handler) = handler().await;

        control.attach("0000:03:00.2", DeviceType::Hostdev, mac(7));
        let diff = handler.sync_devices().await.unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(
            handler.registry("physnet1").unwrap().get_dev_for_vnic(mac(7)),
            Some("0000:03:00.2")
        );
        assert_eq!(handler.resources().get_free_vfs("physnet1"), vec!["0000:03:00.1"]);

        control.detach("0000:03:00.2");
        let diff = handler.sync_devices().await.unwrap();
        assert_eq!(diff.removed.len(), 1);
        assert!(handler.get_vnics(&handler.fabrics()).is_empty());
        assert_eq!(handler.resources().get_free_vfs("physnet1").len(), 2);
    }

    #[tokio::test]
    async fn test_set_fabric_mapping() {
        let (control, mut handler) = handler().await;
        control.set_vfs("eth3", vec![]);

        handler.set_fabric_mapping("physnet2", "eth3").await.unwrap();
        assert_eq!(handler.fabrics(), vec!["physnet1", "physnet2"]);

        // Already mapped interface is left alone
        let mapping = handler.set_fabric_mapping("physnet3", "eth2").await.unwrap();
        assert_eq!(mapping, ("physnet3".to_string(), "eth2".to_string()));
        assert_eq!(handler.fabrics().len(), 2);
    }
}
