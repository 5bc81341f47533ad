//! Segmentation ID allocation for the eSwitch agent.
//!
//! Tracks VLAN ids per physical network, the ranges they are drawn from and
//! the network bindings that consume them. Also hosts the control-plane side
//! port records queried by the agent.

pub mod error;
pub mod plugin;
pub mod ranges;
pub mod vlan_pool;

pub use error::{SegmentError, SegmentResult};
pub use plugin::{DeviceDetails, DeviceDownReply, PluginCallbacks, PortDetails, PortRecord, PortStatus};
pub use ranges::{is_in_ranges, parse_network_vlan_ranges, VlanRange, VlanRangeMap};
pub use vlan_pool::{NetworkBinding, ProvisionRequest, SegmentationIdAllocation, VlanPool};
