//! eSwitch agent - keeps SR-IOV VF bindings in line with the control plane
//!
//! - [`EswitchAgent`]: periodic scan/diff loop with resync on control-plane failures
//! - [`EswitchManager`]: network and port bookkeeping over the handler
//! - [`PluginApi`]: outbound queries, with an in-process [`LocalPluginApi`]
//! - [`AgentNotification`]: inbound port update and network delete events

pub mod agent;
pub mod config;
mod error;
pub mod manager;
pub mod notifications;
pub mod rpc;

pub use agent::{AgentStats, EswitchAgent, LoopPhase, TickOutcome};
pub use config::{AgentConfig, DEFAULT_CONFIG_PATH};
pub use error::{AgentError, AgentResult};
pub use manager::{EswitchManager, NetworkEntry, NetworkPort};
pub use notifications::AgentNotification;
pub use rpc::{DeviceDetails, LocalPluginApi, PluginApi};
