//! Outbound control-plane queries

use std::sync::Arc;

use async_trait::async_trait;
use eswitch_segments::PluginCallbacks;
use tracing::debug;

use crate::error::AgentResult;

pub use eswitch_segments::{DeviceDetails, DeviceDownReply, PortDetails};

/// Queries the agent sends to the control plane
#[async_trait]
pub trait PluginApi: Send + Sync {
    /// Binding details for `device` (a vNIC MAC)
    async fn get_device_details(&self, device: &str, agent_id: &str) -> AgentResult<DeviceDetails>;

    /// Reports that `device` (a port id or MAC) left this agent
    async fn update_device_down(&self, device: &str, agent_id: &str)
        -> AgentResult<DeviceDownReply>;
}

/// In-process plugin backed by [`PluginCallbacks`]
#[derive(Debug, Clone)]
pub struct LocalPluginApi {
    callbacks: Arc<PluginCallbacks>,
}

impl LocalPluginApi {
    pub fn new(callbacks: Arc<PluginCallbacks>) -> Self {
        Self { callbacks }
    }

    pub fn callbacks(&self) -> &Arc<PluginCallbacks> {
        &self.callbacks
    }
}

#[async_trait]
impl PluginApi for LocalPluginApi {
    async fn get_device_details(&self, device: &str, agent_id: &str) -> AgentResult<DeviceDetails> {
        debug!(device, agent_id, "get_device_details");
        Ok(self.callbacks.get_device_details(device, agent_id))
    }

    async fn update_device_down(
        &self,
        device: &str,
        agent_id: &str,
    ) -> AgentResult<DeviceDownReply> {
        debug!(device, agent_id, "update_device_down");
        Ok(self.callbacks.update_device_down(device, agent_id))
    }
}
