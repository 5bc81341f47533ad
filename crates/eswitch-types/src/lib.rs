//! Common types shared by the eSwitch crates.
//!
//! - [`MacAddress`]: 48-bit vNIC MAC addresses
//! - [`VlanTag`]: VLAN tag programmed on a VF, where `0` clears the tag
//! - [`DeviceType`]: how a device is handed to a guest (`hostdev` or `direct`)
//! - [`NetworkType`]: segmentation type of a control-plane network

mod device;
mod mac;
mod vlan;

pub use device::{DeviceType, NetworkType};
pub use mac::MacAddress;
pub use vlan::VlanTag;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN tag: {0} (must be 0-4094)")]
    InvalidVlanTag(u32),

    #[error("invalid device type: {0}")]
    InvalidDeviceType(String),

    #[error("invalid network type: {0}")]
    InvalidNetworkType(String),
}
