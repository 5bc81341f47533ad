//! Device and network classifications.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a device is handed to a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// SR-IOV VF passed through by PCI address.
    Hostdev,
    /// Plain interface attached through macvtap.
    Direct,
}

impl DeviceType {
    /// Returns the libvirt-style name of the type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Hostdev => "hostdev",
            DeviceType::Direct => "direct",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hostdev" => Ok(DeviceType::Hostdev),
            "direct" => Ok(DeviceType::Direct),
            _ => Err(ParseError::InvalidDeviceType(s.to_string())),
        }
    }
}

/// Segmentation type of a control-plane network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// 802.1Q VLAN segmentation.
    Vlan,
    /// InfiniBand partition. Recognized but not provisioned.
    Ib,
}

impl NetworkType {
    /// Returns the wire name of the type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Vlan => "vlan",
            NetworkType::Ib => "ib",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vlan" => Ok(NetworkType::Vlan),
            "ib" => Ok(NetworkType::Ib),
            _ => Err(ParseError::InvalidNetworkType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_round_trip_names() {
        assert_eq!("hostdev".parse::<DeviceType>().unwrap(), DeviceType::Hostdev);
        assert_eq!("DIRECT".parse::<DeviceType>().unwrap(), DeviceType::Direct);
        assert_eq!(DeviceType::Hostdev.to_string(), "hostdev");
        assert!("bridge".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_network_type() {
        assert_eq!("vlan".parse::<NetworkType>().unwrap(), NetworkType::Vlan);
        assert_eq!(NetworkType::Ib.as_str(), "ib");
        assert!("vxlan".parse::<NetworkType>().is_err());
    }
}
