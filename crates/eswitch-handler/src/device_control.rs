//! Device control interface
//!
//! [`DeviceControl`] is the boundary between the handler and the host: link
//! admin state, per-VF VLAN programming, VF enumeration and discovery of
//! devices that currently carry a vNIC.
//!
//! - [`IpLinkControl`] drives `/sbin/ip` through a [`CommandRunner`] and reads
//!   VF topology from sysfs.
//! - [`RecordingControl`] keeps an in-memory topology and records every
//!   mutating call, for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eswitch_common::shell::{CommandRunner, ShellRunner, SYSFS_NET};
use eswitch_common::{CommandError, CommandResult};
use eswitch_types::{DeviceType, MacAddress, VlanTag};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::commands::{
    build_set_link_cmd, build_set_vf_vlan_cmd, build_show_link_cmd, build_show_macvtap_cmd,
    parse_macvtap_links, parse_vf_macs, parse_virtfn_index,
};

/// A virtual function of a PF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfInfo {
    /// Index of the VF on its PF
    pub vf_index: u16,
    /// PCI address (`0000:03:00.1`)
    pub pci_address: String,
    /// Netdev name, when the VF is bound to a network driver
    pub netdev: Option<String>,
}

impl VfInfo {
    pub fn new(vf_index: u16, pci_address: impl Into<String>, netdev: Option<&str>) -> Self {
        Self {
            vf_index,
            pci_address: pci_address.into(),
            netdev: netdev.map(str::to_string),
        }
    }
}

/// A device that currently carries a vNIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    /// PCI address for hostdev devices, netdev name for direct devices
    pub dev: String,
    pub dev_type: DeviceType,
    pub mac: Option<MacAddress>,
}

/// Low-level interface and VLAN programming
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Sets the admin state of a link
    async fn set_link(&self, dev: &str, up: bool) -> CommandResult<()>;

    /// Programs the VLAN and priority of a VF. VLAN 0 clears.
    async fn set_vf_vlan(&self, pf: &str, vf_index: u16, vlan: VlanTag, qos: u8)
        -> CommandResult<()>;

    /// Enumerates the VFs of a PF, ordered by VF index
    async fn list_vfs(&self, pf: &str) -> CommandResult<Vec<VfInfo>>;

    /// Lists the devices on the given PFs that are attached to a vNIC
    async fn list_attached(&self, pfs: &[String]) -> CommandResult<Vec<AttachedDevice>>;
}

/// Production device control using `ip` and sysfs
#[derive(Debug, Clone)]
pub struct IpLinkControl<R = ShellRunner> {
    runner: R,
    sysfs_root: PathBuf,
}

impl IpLinkControl<ShellRunner> {
    /// Creates a controller that runs commands through `sudo` when `root_helper` is set
    pub fn new(root_helper: Option<&str>) -> Self {
        let runner = match root_helper {
            Some(helper) => ShellRunner::with_root_helper(helper),
            None => ShellRunner::new(),
        };
        Self::with_runner(runner)
    }
}

impl<R: CommandRunner> IpLinkControl<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            sysfs_root: PathBuf::from(SYSFS_NET),
        }
    }

    /// Reads VF topology below `root` instead of `/sys/class/net`
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn device_dir(&self, pf: &str) -> PathBuf {
        self.sysfs_root.join(pf).join("device")
    }

    async fn first_entry(dir: &Path) -> Option<String> {
        let mut entries = tokio::fs::read_dir(dir).await.ok()?;
        let entry = entries.next_entry().await.ok()??;
        entry.file_name().to_str().map(str::to_string)
    }
}

#[async_trait]
impl<R: CommandRunner> DeviceControl for IpLinkControl<R> {
    async fn set_link(&self, dev: &str, up: bool) -> CommandResult<()> {
        self.runner.run_or_throw(&build_set_link_cmd(dev, up)).await?;
        Ok(())
    }

    async fn set_vf_vlan(
        &self,
        pf: &str,
        vf_index: u16,
        vlan: VlanTag,
        qos: u8,
    ) -> CommandResult<()> {
        self.runner
            .run_or_throw(&build_set_vf_vlan_cmd(pf, vf_index, vlan, qos))
            .await?;
        Ok(())
    }

    async fn list_vfs(&self, pf: &str) -> CommandResult<Vec<VfInfo>> {
        let device_dir = self.device_dir(pf);
        let sysfs_err = |e| CommandError::sysfs(device_dir.display().to_string(), e);

        let mut entries = tokio::fs::read_dir(&device_dir).await.map_err(sysfs_err)?;
        let mut vfs = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(sysfs_err)? {
            let name = entry.file_name();
            let Some(vf_index) = name.to_str().and_then(parse_virtfn_index) else {
                continue;
            };

            let link = tokio::fs::read_link(entry.path())
                .await
                .map_err(|e| CommandError::sysfs(entry.path().display().to_string(), e))?;
            let Some(pci_address) = link.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let netdev = Self::first_entry(&entry.path().join("net")).await;
            vfs.push(VfInfo {
                vf_index,
                pci_address: pci_address.to_string(),
                netdev,
            });
        }

        vfs.sort_by_key(|vf| vf.vf_index);
        debug!(pf, count = vfs.len(), "Enumerated VFs");
        Ok(vfs)
    }

    async fn list_attached(&self, pfs: &[String]) -> CommandResult<Vec<AttachedDevice>> {
        let macvtap_cmd = build_show_macvtap_cmd();
        let macvtaps = parse_macvtap_links(&self.runner.run_or_throw(&macvtap_cmd).await?);
        let lowers: HashSet<&str> = macvtaps.iter().map(|m| m.lower.as_str()).collect();

        let mut attached = Vec::new();
        for pf in pfs {
            let vfs = self.list_vfs(pf).await?;
            let output = self.runner.run_or_throw(&build_show_link_cmd(pf)).await?;

            for (vf_index, mac) in parse_vf_macs(&output) {
                if mac.is_zero() {
                    continue;
                }
                let Some(vf) = vfs.iter().find(|vf| vf.vf_index == vf_index) else {
                    continue;
                };
                // A VF under a macvtap is reported as a direct device instead
                if vf.netdev.as_deref().is_some_and(|n| lowers.contains(n)) {
                    continue;
                }
                attached.push(AttachedDevice {
                    dev: vf.pci_address.clone(),
                    dev_type: DeviceType::Hostdev,
                    mac: Some(mac),
                });
            }
        }

        attached.extend(macvtaps.into_iter().map(|link| AttachedDevice {
            dev: link.lower,
            dev_type: DeviceType::Direct,
            mac: Some(link.mac),
        }));
        Ok(attached)
    }
}

/// A mutating call seen by [`RecordingControl`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    SetLink {
        dev: String,
        up: bool,
    },
    SetVfVlan {
        pf: String,
        vf_index: u16,
        vlan: VlanTag,
        qos: u8,
    },
}

/// In-memory device control
///
/// Holds a fixed VF topology per PF and a settable list of attached devices.
/// Mutating calls are recorded in order; calls naming a device or PF given to
/// [`fail_on`](Self::fail_on) fail with a command error.
#[derive(Debug, Default)]
pub struct RecordingControl {
    vfs: Mutex<HashMap<String, Vec<VfInfo>>>,
    attached: Mutex<Vec<AttachedDevice>>,
    ops: Mutex<Vec<DeviceOp>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a PF with `count` VFs.
    ///
    /// VF `i` gets PCI address `<pci_prefix>.<i + 1>` and netdev `<pf>f<i>`.
    pub fn with_pf(self, pf: &str, pci_prefix: &str, count: u16) -> Self {
        let vfs = (0..count)
            .map(|i| {
                VfInfo::new(
                    i,
                    format!("{}.{}", pci_prefix, i + 1),
                    Some(format!("{}f{}", pf, i).as_str()),
                )
            })
            .collect();
        self.vfs.lock().insert(pf.to_string(), vfs);
        self
    }

    /// Replaces the VF list of a PF
    pub fn set_vfs(&self, pf: &str, vfs: Vec<VfInfo>) {
        self.vfs.lock().insert(pf.to_string(), vfs);
    }

    /// Marks `dev` as carrying `mac`
    pub fn attach(&self, dev: &str, dev_type: DeviceType, mac: MacAddress) {
        let mut attached = self.attached.lock();
        attached.retain(|a| a.dev != dev);
        attached.push(AttachedDevice {
            dev: dev.to_string(),
            dev_type,
            mac: Some(mac),
        });
    }

    pub fn detach(&self, dev: &str) {
        self.attached.lock().retain(|a| a.dev != dev);
    }

    /// Makes every call naming `target` fail
    pub fn fail_on(&self, target: &str) {
        self.failing.lock().insert(target.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Returns recorded mutating calls
    pub fn ops(&self) -> Vec<DeviceOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    fn check(&self, target: &str, command: String) -> CommandResult<()> {
        if self.failing.lock().contains(target) {
            return Err(CommandError::Failed {
                command,
                exit_code: 1,
                output: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for RecordingControl {
    async fn set_link(&self, dev: &str, up: bool) -> CommandResult<()> {
        self.ops.lock().push(DeviceOp::SetLink {
            dev: dev.to_string(),
            up,
        });
        info!(dev, up, "Recorded link state change");
        self.check(dev, build_set_link_cmd(dev, up))
    }

    async fn set_vf_vlan(
        &self,
        pf: &str,
        vf_index: u16,
        vlan: VlanTag,
        qos: u8,
    ) -> CommandResult<()> {
        self.ops.lock().push(DeviceOp::SetVfVlan {
            pf: pf.to_string(),
            vf_index,
            vlan,
            qos,
        });
        info!(pf, vf_index, %vlan, qos, "Recorded VF VLAN change");
        self.check(pf, build_set_vf_vlan_cmd(pf, vf_index, vlan, qos))
    }

    async fn list_vfs(&self, pf: &str) -> CommandResult<Vec<VfInfo>> {
        self.check(pf, format!("list vfs {}", pf))?;
        self.vfs.lock().get(pf).cloned().ok_or_else(|| {
            CommandError::sysfs(
                format!("{}/{}/device", SYSFS_NET, pf),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })
    }

    async fn list_attached(&self, _pfs: &[String]) -> CommandResult<Vec<AttachedDevice>> {
        Ok(self.attached.lock().clone())
    }
}
