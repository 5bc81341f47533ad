//! Reconciliation loop against the recording device control and the
//! in-process plugin.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eswitch_agent::rpc::DeviceDownReply;
use eswitch_agent::{
    AgentError, AgentNotification, AgentResult, DeviceDetails, EswitchAgent, EswitchManager,
    LocalPluginApi, LoopPhase, PluginApi, TickOutcome,
};
use eswitch_handler::{DeviceOp, EswitchHandler, RecordingControl};
use eswitch_segments::{PluginCallbacks, PortRecord, PortStatus, VlanPool};
use eswitch_types::{DeviceType, MacAddress, NetworkType, VlanTag};
use pretty_assertions::assert_eq;

const PHYS_NET: &str = "physnet1";
const PF: &str = "eth2";
const DEV: &str = "eth2f0";
const NETWORK_ID: &str = "net-1";
const PORT_ID: &str = "3b1a7c2e-5d4f-4c1e-9a0b-1234567890ab";
const VLAN: u16 = 100;

fn vnic() -> MacAddress {
    "fa:16:3e:00:00:01".parse().unwrap()
}

/// Plugin that can be switched to fail every call
struct FlakyPlugin {
    inner: LocalPluginApi,
    failing: AtomicBool,
}

impl FlakyPlugin {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &'static str, device: &str) -> AgentResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::unreachable(operation, device, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl PluginApi for FlakyPlugin {
    async fn get_device_details(&self, device: &str, agent_id: &str) -> AgentResult<DeviceDetails> {
        self.check("get_device_details", device)?;
        self.inner.get_device_details(device, agent_id).await
    }

    async fn update_device_down(
        &self,
        device: &str,
        agent_id: &str,
    ) -> AgentResult<DeviceDownReply> {
        self.check("update_device_down", device)?;
        self.inner.update_device_down(device, agent_id).await
    }
}

struct Fixture {
    control: Arc<RecordingControl>,
    callbacks: Arc<PluginCallbacks>,
    plugin: Arc<FlakyPlugin>,
    agent: EswitchAgent,
}

async fn setup() -> Fixture {
    let control = Arc::new(RecordingControl::new().with_pf(PF, "0000:03:00", 2));
    let mappings = BTreeMap::from([(PHYS_NET.to_string(), PF.to_string())]);
    let mut manager = EswitchManager::new(EswitchHandler::new(control.clone()), mappings);
    manager.define_fabric_mappings().await.unwrap();

    let pool = Arc::new(VlanPool::new());
    pool.add_network_binding(NETWORK_ID, NetworkType::Vlan, PHYS_NET, VLAN);
    let callbacks = Arc::new(PluginCallbacks::new(pool));
    callbacks.upsert_port(PortRecord::new(PORT_ID, vnic(), NETWORK_ID));

    let plugin = Arc::new(FlakyPlugin {
        inner: LocalPluginApi::new(callbacks.clone()),
        failing: AtomicBool::new(false),
    });
    let agent = EswitchAgent::new(
        manager,
        plugin.clone(),
        "eswitch-agent.test",
        Duration::from_millis(10),
    );

    Fixture {
        control,
        callbacks,
        plugin,
        agent,
    }
}

fn vlan_sequence(vlan: u16) -> Vec<DeviceOp> {
    vec![
        DeviceOp::SetLink {
            dev: DEV.to_string(),
            up: false,
        },
        DeviceOp::SetVfVlan {
            pf: PF.to_string(),
            vf_index: 0,
            vlan: VlanTag::new(vlan).unwrap(),
            qos: 0,
        },
        DeviceOp::SetLink {
            dev: DEV.to_string(),
            up: true,
        },
    ]
}

/// Attaches the vNIC and runs ticks until its port is up
async fn port_up(fx: &mut Fixture) {
    assert_eq!(fx.agent.tick().await, TickOutcome::Unchanged);
    fx.control.attach(DEV, DeviceType::Direct, vnic());
    assert_eq!(
        fx.agent.tick().await,
        TickOutcome::Applied {
            added: 1,
            removed: 0
        }
    );
}

#[tokio::test]
async fn test_added_device_gets_network_vlan() {
    let mut fx = setup().await;
    port_up(&mut fx).await;

    assert_eq!(fx.control.ops(), vlan_sequence(VLAN));
    assert_eq!(fx.callbacks.get_port(PORT_ID).unwrap().status, PortStatus::Active);
    assert_eq!(fx.agent.manager().get_port_id_by_mac(vnic()), PORT_ID);
    assert!(fx.agent.known_devices().contains_key(DEV));
    assert_eq!(fx.agent.stats().devices_added, 1);

    // Nothing changed since
    assert_eq!(fx.agent.tick().await, TickOutcome::Unchanged);
    assert_eq!(fx.control.ops().len(), 3);
}

#[tokio::test]
async fn test_details_failure_flags_resync() {
    let mut fx = setup().await;
    assert_eq!(fx.agent.tick().await, TickOutcome::Unchanged);

    fx.control.attach(DEV, DeviceType::Direct, vnic());
    fx.plugin.set_failing(true);

    assert_eq!(fx.agent.tick().await, TickOutcome::ResyncNeeded);
    assert!(fx.agent.needs_resync());
    assert_eq!(fx.agent.phase(), LoopPhase::ResyncFlagged);
    assert!(fx.agent.known_devices().is_empty());
    assert!(fx.control.ops().is_empty());
    assert_eq!(fx.agent.stats().resyncs, 1);

    // Next tick starts from an empty known set and re-treats the device
    fx.plugin.set_failing(false);
    assert_eq!(
        fx.agent.tick().await,
        TickOutcome::Applied {
            added: 1,
            removed: 0
        }
    );
    assert!(!fx.agent.needs_resync());
    assert_eq!(fx.agent.phase(), LoopPhase::Succeeded);
    assert_eq!(fx.control.ops(), vlan_sequence(VLAN));
}

#[tokio::test]
async fn test_removed_device_is_released() {
    let mut fx = setup().await;
    port_up(&mut fx).await;
    fx.control.clear_ops();

    fx.control.detach(DEV);
    assert_eq!(
        fx.agent.tick().await,
        TickOutcome::Applied {
            added: 0,
            removed: 1
        }
    );

    assert_eq!(fx.control.ops(), vlan_sequence(0));
    assert_eq!(fx.callbacks.get_port(PORT_ID).unwrap().status, PortStatus::Down);
    assert!(fx.agent.manager().get_vnics_mac().is_empty());
    assert!(fx.agent.manager().network(NETWORK_ID).unwrap().ports.is_empty());
    assert_eq!(
        fx.agent.manager().handler().resources().get_free_eths(PHYS_NET),
        vec!["eth2f0", "eth2f1"]
    );
}

#[tokio::test]
async fn test_removal_during_resync_is_not_lost() {
    let mut fx = setup().await;
    assert_eq!(fx.agent.tick().await, TickOutcome::Unchanged);

    fx.control.attach(DEV, DeviceType::Direct, vnic());
    fx.plugin.set_failing(true);
    assert_eq!(fx.agent.tick().await, TickOutcome::ResyncNeeded);

    fx.control.detach(DEV);
    fx.plugin.set_failing(false);
    assert_eq!(
        fx.agent.tick().await,
        TickOutcome::Applied {
            added: 0,
            removed: 1
        }
    );
    assert!(fx.agent.manager().handler().attached_devices().is_empty());
    assert_eq!(
        fx.agent.manager().handler().resources().get_free_eths(PHYS_NET).len(),
        2
    );
}

#[tokio::test]
async fn test_down_report_failure_keeps_device() {
    let mut fx = setup().await;
    port_up(&mut fx).await;

    fx.control.detach(DEV);
    fx.plugin.set_failing(true);
    assert_eq!(fx.agent.tick().await, TickOutcome::ResyncNeeded);
    assert_eq!(
        fx.agent.manager().handler().registry(PHYS_NET).unwrap().get_dev_for_vnic(vnic()),
        Some(DEV)
    );

    fx.plugin.set_failing(false);
    assert_eq!(
        fx.agent.tick().await,
        TickOutcome::Applied {
            added: 0,
            removed: 1
        }
    );
    assert_eq!(fx.callbacks.get_port(PORT_ID).unwrap().status, PortStatus::Down);
}

#[tokio::test]
async fn test_port_update_admin_down_clears_vlan() {
    let mut fx = setup().await;
    port_up(&mut fx).await;
    fx.control.clear_ops();

    let mut port = PortRecord::new(PORT_ID, vnic(), NETWORK_ID);
    port.admin_state_up = false;
    fx.agent
        .handle_notification(AgentNotification::PortUpdate {
            port,
            network_type: "vlan".to_string(),
            physical_network: PHYS_NET.to_string(),
            vlan_id: VLAN,
        })
        .await
        .unwrap();

    assert_eq!(fx.control.ops(), vlan_sequence(0));
    assert_eq!(
        fx.agent.manager().handler().registry(PHYS_NET).unwrap().get_vlan(vnic()),
        Some(VlanTag::CLEAR)
    );
}

#[tokio::test]
async fn test_port_update_moves_vlan() {
    let mut fx = setup().await;
    port_up(&mut fx).await;
    fx.control.clear_ops();

    fx.agent
        .handle_notification(AgentNotification::PortUpdate {
            port: PortRecord::new(PORT_ID, vnic(), "net-2"),
            network_type: "vlan".to_string(),
            physical_network: PHYS_NET.to_string(),
            vlan_id: 200,
        })
        .await
        .unwrap();

    assert_eq!(fx.control.ops(), vlan_sequence(200));
    assert_eq!(fx.agent.manager().network("net-2").unwrap().vlan_id, 200);
    assert_eq!(fx.agent.manager().network("net-2").unwrap().ports.len(), 1);
    assert!(fx.agent.manager().network(NETWORK_ID).unwrap().ports.is_empty());
    assert_eq!(fx.agent.manager().get_port_id_by_mac(vnic()), PORT_ID);
}

#[tokio::test]
async fn test_port_update_for_unknown_vnic_is_ignored() {
    let mut fx = setup().await;
    assert_eq!(fx.agent.tick().await, TickOutcome::Unchanged);

    fx.agent
        .handle_notification(AgentNotification::PortUpdate {
            port: PortRecord::new(PORT_ID, vnic(), NETWORK_ID),
            network_type: "vlan".to_string(),
            physical_network: PHYS_NET.to_string(),
            vlan_id: VLAN,
        })
        .await
        .unwrap();

    assert!(fx.control.ops().is_empty());
    assert!(fx.agent.manager().network(NETWORK_ID).is_none());
}

#[tokio::test]
async fn test_port_update_unknown_network_type() {
    let mut fx = setup().await;
    port_up(&mut fx).await;

    let result = fx
        .agent
        .handle_notification(AgentNotification::PortUpdate {
            port: PortRecord::new(PORT_ID, vnic(), "net-gre"),
            network_type: "gre".to_string(),
            physical_network: PHYS_NET.to_string(),
            vlan_id: 7,
        })
        .await;

    assert!(matches!(result, Err(AgentError::UnsupportedNetworkType { .. })));
    assert!(fx.agent.manager().network("net-gre").is_none());
}

#[tokio::test]
async fn test_hardware_failure_flags_resync() {
    let mut fx = setup().await;
    assert_eq!(fx.agent.tick().await, TickOutcome::Unchanged);

    fx.control.fail_on(DEV);
    fx.control.attach(DEV, DeviceType::Direct, vnic());
    assert_eq!(fx.agent.tick().await, TickOutcome::ResyncNeeded);
    assert!(fx.agent.needs_resync());
    assert!(fx.agent.known_devices().is_empty());
    assert_eq!(
        fx.agent.manager().handler().registry(PHYS_NET).unwrap().get_vlan(vnic()),
        None
    );

    fx.control.clear_failures();
    assert_eq!(
        fx.agent.tick().await,
        TickOutcome::Applied {
            added: 1,
            removed: 0
        }
    );
    assert!(!fx.agent.needs_resync());
    assert_eq!(
        fx.agent.manager().handler().registry(PHYS_NET).unwrap().get_vlan(vnic()),
        VlanTag::new(VLAN).ok()
    );
    assert!(fx.agent.known_devices().contains_key(DEV));
}

#[tokio::test]
async fn test_hardware_failure_on_removal_is_retried() {
    let mut fx = setup().await;
    port_up(&mut fx).await;

    fx.control.fail_on(DEV);
    fx.control.detach(DEV);
    assert_eq!(fx.agent.tick().await, TickOutcome::ResyncNeeded);
    assert_eq!(
        fx.agent.manager().handler().registry(PHYS_NET).unwrap().get_dev_for_vnic(vnic()),
        Some(DEV)
    );

    fx.control.clear_failures();
    fx.control.clear_ops();
    assert_eq!(
        fx.agent.tick().await,
        TickOutcome::Applied {
            added: 0,
            removed: 1
        }
    );
    assert_eq!(fx.control.ops(), vlan_sequence(0));
    assert!(fx.agent.manager().handler().attached_devices().is_empty());
}

#[tokio::test]
async fn test_refused_duplicate_mac_does_not_disturb_bound_vf() {
    let mut fx = setup().await;
    port_up(&mut fx).await;
    fx.control.clear_ops();

    // Same vNIC MAC shows up on a second VF; the attach is refused
    fx.control.attach("eth2f1", DeviceType::Direct, vnic());
    fx.agent.tick().await;
    assert!(!fx.agent.known_devices().contains_key("eth2f1"));
    assert!(fx.agent.known_devices().contains_key(DEV));

    fx.control.detach("eth2f1");
    fx.agent.tick().await;

    assert!(!fx
        .control
        .ops()
        .iter()
        .any(|op| matches!(op, DeviceOp::SetVfVlan { vlan, .. } if *vlan == VlanTag::CLEAR)));
    let registry = fx.agent.manager().handler().registry(PHYS_NET).unwrap();
    assert_eq!(registry.get_dev_for_vnic(vnic()), Some(DEV));
    assert_eq!(registry.get_vlan(vnic()), VlanTag::new(VLAN).ok());
    assert_eq!(fx.callbacks.get_port(PORT_ID).unwrap().status, PortStatus::Active);
    assert_eq!(
        fx.agent.manager().handler().resources().get_free_eths(PHYS_NET),
        vec!["eth2f1"]
    );
}
