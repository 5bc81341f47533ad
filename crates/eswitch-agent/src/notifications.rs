//! Inbound control-plane notifications

use eswitch_segments::PortRecord;

/// Port lifecycle events pushed by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentNotification {
    /// A port changed; applied only if its vNIC is attached on this agent
    PortUpdate {
        port: PortRecord,
        network_type: String,
        physical_network: String,
        vlan_id: u16,
    },
    /// A network was deleted; ignored without a network id
    NetworkDelete {
        network_id: Option<String>,
        physical_network: Option<String>,
        vlan_id: Option<u16>,
    },
}

impl AgentNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentNotification::PortUpdate { .. } => "port_update",
            AgentNotification::NetworkDelete { .. } => "network_delete",
        }
    }
}
