//! eSwitch handler - SR-IOV device inventory and vNIC binding
//!
//! Tracks the physical and virtual functions behind each fabric, binds them
//! to vNICs by MAC and programs per-VF VLAN policy through a
//! [`DeviceControl`] implementation.

mod commands;
pub mod device_control;
mod diff;
mod error;
mod handler;
mod port_registry;
mod resource_mgr;

pub use commands::*;
pub use device_control::{AttachedDevice, DeviceControl, DeviceOp, IpLinkControl, RecordingControl, VfInfo};
pub use diff::{diff_devices, DeviceDiff};
pub use error::{EswitchError, EswitchResult};
pub use handler::EswitchHandler;
pub use port_registry::{PortEntry, PortRegistry, VnicBinding};
pub use resource_mgr::{AttachedDevices, Device, ResourceManager, ScannedDevice};
