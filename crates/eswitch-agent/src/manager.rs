//! EswitchManager - control-plane bookkeeping on top of the handler
//!
//! Tracks which ports of which networks are up on this agent and turns port
//! state changes into handler VLAN operations. Fabric names are the physical
//! network names of the interface mappings.

use std::collections::{BTreeMap, BTreeSet};

use eswitch_handler::EswitchHandler;
use eswitch_types::{MacAddress, NetworkType, VlanTag};
use tracing::{debug, error, info, instrument};

use crate::error::{AgentError, AgentResult};

/// A port known to be up in a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPort {
    pub port_id: String,
    pub port_mac: MacAddress,
}

/// A network provisioned on this agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    pub physical_network: String,
    pub network_type: NetworkType,
    pub vlan_id: u16,
    pub ports: Vec<NetworkPort>,
}

impl NetworkEntry {
    fn has_port(&self, mac: MacAddress) -> bool {
        self.ports.iter().any(|p| p.port_mac == mac)
    }
}

pub struct EswitchManager {
    handler: EswitchHandler,
    interface_mappings: BTreeMap<String, String>,
    network_map: BTreeMap<String, NetworkEntry>,
}

impl EswitchManager {
    pub fn new(handler: EswitchHandler, interface_mappings: BTreeMap<String, String>) -> Self {
        Self {
            handler,
            interface_mappings,
            network_map: BTreeMap::new(),
        }
    }

    /// Maps every physical network to its interface on the handler
    pub async fn define_fabric_mappings(&mut self) -> AgentResult<()> {
        for (physical_network, interface) in &self.interface_mappings {
            self.handler
                .set_fabric_mapping(physical_network, interface)
                .await?;
            debug!(
                physical_network = %physical_network,
                interface = %interface,
                "Physical network mapped to interface"
            );
        }
        Ok(())
    }

    pub fn interface_mappings(&self) -> &BTreeMap<String, String> {
        &self.interface_mappings
    }

    pub fn handler(&self) -> &EswitchHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut EswitchHandler {
        &mut self.handler
    }

    pub fn network(&self, network_id: &str) -> Option<&NetworkEntry> {
        self.network_map.get(network_id)
    }

    pub fn networks(&self) -> &BTreeMap<String, NetworkEntry> {
        &self.network_map
    }

    /// Port id recorded for `port_mac`, or the MAC itself when unknown
    pub fn get_port_id_by_mac(&self, port_mac: MacAddress) -> String {
        self.network_map
            .values()
            .flat_map(|n| n.ports.iter())
            .find(|p| p.port_mac == port_mac)
            .map(|p| p.port_id.clone())
            .unwrap_or_else(|| port_mac.to_string())
    }

    /// MACs of all vNICs attached on the mapped fabrics
    pub fn get_vnics_mac(&self) -> BTreeSet<MacAddress> {
        self.handler
            .get_vnics(&self.handler.fabrics())
            .into_keys()
            .collect()
    }

    pub fn vnic_port_exists(&self, port_mac: MacAddress) -> bool {
        self.get_vnics_mac().contains(&port_mac)
    }

    /// Records a network on this agent.
    ///
    /// VLAN and IB networks are recorded; IB is not programmed. A network
    /// already recorded keeps its ports.
    #[instrument(skip(self))]
    pub fn provision_network(
        &mut self,
        network_id: &str,
        network_type: &str,
        physical_network: &str,
        vlan_id: u16,
    ) -> AgentResult<&NetworkEntry> {
        info!("Provisioning network");

        let network_type: NetworkType = match network_type.parse() {
            Ok(t) => t,
            Err(_) => {
                error!("Cannot provision unknown network type");
                return Err(AgentError::UnsupportedNetworkType {
                    network_id: network_id.to_string(),
                    network_type: network_type.to_string(),
                });
            }
        };
        match network_type {
            NetworkType::Vlan => debug!("Creating VLAN network"),
            NetworkType::Ib => debug!("IB network provisioning is not supported"),
        }

        Ok(self
            .network_map
            .entry(network_id.to_string())
            .or_insert_with(|| NetworkEntry {
                physical_network: physical_network.to_string(),
                network_type,
                vlan_id,
                ports: Vec::new(),
            }))
    }

    /// Forgets a network. Ports already programmed keep their VLAN.
    pub fn remove_network(&mut self, network_id: &str) -> Option<NetworkEntry> {
        let removed = self.network_map.remove(network_id);
        if removed.is_none() {
            debug!(network_id, "Network not defined on agent");
        }
        removed
    }

    /// Records the port in its network and programs its VLAN
    #[instrument(skip(self))]
    pub async fn port_up(
        &mut self,
        network_id: &str,
        network_type: &str,
        physical_network: &str,
        vlan_id: u16,
        port_id: &str,
        port_mac: MacAddress,
    ) -> AgentResult<()> {
        debug!("Connecting port");

        let network = self.provision_network(network_id, network_type, physical_network, vlan_id)?;
        let network_type = network.network_type;

        // A vNIC belongs to one network at a time
        for network in self.network_map.values_mut() {
            network.ports.retain(|p| p.port_mac != port_mac);
        }
        if let Some(network) = self.network_map.get_mut(network_id) {
            network.ports.push(NetworkPort {
                port_id: port_id.to_string(),
                port_mac,
            });
        }

        match network_type {
            NetworkType::Vlan => {
                let vlan = VlanTag::new(vlan_id)?;
                info!("Binding VLAN to eSwitch for vNIC");
                self.handler.set_vlan(physical_network, port_mac, vlan).await?;
                info!("Port is up");
            }
            NetworkType::Ib => debug!("Network type IB is not supported"),
        }
        Ok(())
    }

    /// Clears the VLAN of a port known to be up. Returns whether it was known.
    #[instrument(skip(self))]
    pub async fn port_down(
        &mut self,
        network_id: &str,
        physical_network: &str,
        port_mac: MacAddress,
    ) -> AgentResult<bool> {
        if !self.network_map.values().any(|n| n.has_port(port_mac)) {
            info!("Port is not available on this agent");
            return Ok(false);
        }

        self.handler.port_release(physical_network, port_mac).await?;
        info!("Port is down");
        Ok(true)
    }

    /// Clears the VLAN of `port_mac` and drops it from its network
    #[instrument(skip(self))]
    pub async fn port_release(&mut self, port_mac: MacAddress) -> AgentResult<bool> {
        let Some((network_id, physical_network)) = self
            .network_map
            .iter()
            .find(|(_, n)| n.has_port(port_mac))
            .map(|(id, n)| (id.clone(), n.physical_network.clone()))
        else {
            info!("Port is not available on this agent");
            return Ok(false);
        };

        self.handler.port_release(&physical_network, port_mac).await?;
        for network in self.network_map.values_mut() {
            network.ports.retain(|p| p.port_mac != port_mac);
        }
        info!(network_id = %network_id, "Port released");
        Ok(true)
    }
}

impl std::fmt::Debug for EswitchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EswitchManager")
            .field("interface_mappings", &self.interface_mappings)
            .field("networks", &self.network_map.len())
            .finish()
    }
}
