//! End-to-end handler behavior against the recording device control.

use std::sync::Arc;

use eswitch_handler::{
    DeviceOp, EswitchError, EswitchHandler, RecordingControl, ScannedDevice, VfInfo,
};
use eswitch_types::{DeviceType, MacAddress, VlanTag};
use pretty_assertions::assert_eq;

const FABRIC: &str = "F1";
const PF: &str = "eth2";

fn vnic() -> MacAddress {
    "00:00:00:00:aa:bb".parse().unwrap()
}

async fn setup(vf_count: u16) -> (Arc<RecordingControl>, EswitchHandler) {
    let control = Arc::new(RecordingControl::new().with_pf(PF, "0000:03:00", vf_count));
    let mut handler = EswitchHandler::new(control.clone());
    handler
        .add_fabrics(&[(FABRIC.to_string(), PF.to_string())])
        .await
        .unwrap();
    (control, handler)
}

fn vlan_sequence(vlan: u16) -> Vec<DeviceOp> {
    vec![
        DeviceOp::SetLink {
            dev: "eth2f0".to_string(),
            up: false,
        },
        DeviceOp::SetVfVlan {
            pf: PF.to_string(),
            vf_index: 0,
            vlan: VlanTag::new(vlan).unwrap(),
            qos: 0,
        },
        DeviceOp::SetLink {
            dev: "eth2f0".to_string(),
            up: true,
        },
    ]
}

#[tokio::test]
async fn test_create_port_then_set_vlan_sequence() {
    let (control, mut handler) = setup(2).await;

    let dev = handler
        .create_port(FABRIC, DeviceType::Hostdev, Some("vm-1"), vnic())
        .unwrap();
    assert_eq!(dev, "0000:03:00.1");

    handler
        .set_vlan(FABRIC, vnic(), VlanTag::new(100).unwrap())
        .await
        .unwrap();

    assert_eq!(control.ops(), vlan_sequence(100));
    assert_eq!(
        handler.registry(FABRIC).unwrap().get_vlan(vnic()),
        Some(VlanTag::new(100).unwrap())
    );
}

#[tokio::test]
async fn test_port_release_equals_clear_vlan() {
    let (control, mut handler) = setup(2).await;
    handler.create_port(FABRIC, DeviceType::Hostdev, None, vnic());

    handler.port_release(FABRIC, vnic()).await.unwrap();
    let released = control.ops();
    control.clear_ops();

    handler.set_vlan(FABRIC, vnic(), VlanTag::CLEAR).await.unwrap();
    assert_eq!(control.ops(), released);
    assert_eq!(released, vlan_sequence(0));
    assert_eq!(
        handler.registry(FABRIC).unwrap().get_vlan(vnic()),
        Some(VlanTag::CLEAR)
    );
}

#[tokio::test]
async fn test_scan_collision_rolls_back_allocation() {
    let (control, mut handler) = setup(2).await;
    handler.create_port(FABRIC, DeviceType::Direct, None, vnic());

    // The same MAC shows up on a second VF
    control.attach("eth2f1", DeviceType::Direct, vnic());
    handler.sync_devices().await.unwrap();

    assert_eq!(handler.resources().get_free_eths(FABRIC), vec!["eth2f1"]);
    assert_eq!(
        handler.registry(FABRIC).unwrap().get_dev_for_vnic(vnic()),
        Some("eth2f0")
    );
    assert!(handler
        .registry(FABRIC)
        .unwrap()
        .get_port("eth2f1")
        .unwrap()
        .vnic
        .is_none());
}

#[tokio::test]
async fn test_refused_duplicate_leaves_binding_intact() {
    let (control, mut handler) = setup(2).await;
    control.attach("eth2f0", DeviceType::Direct, vnic());
    handler.sync_devices().await.unwrap();
    assert_eq!(
        handler.registry(FABRIC).unwrap().get_dev_for_vnic(vnic()),
        Some("eth2f0")
    );

    // Same MAC shows up on a second VF, is refused, then goes away
    control.attach("eth2f1", DeviceType::Direct, vnic());
    handler.sync_devices().await.unwrap();
    assert!(!handler.attached_devices().contains_key("eth2f1"));

    control.detach("eth2f1");
    handler.sync_devices().await.unwrap();

    assert_eq!(
        handler.registry(FABRIC).unwrap().get_dev_for_vnic(vnic()),
        Some("eth2f0")
    );
    assert!(handler.resources().get_device("eth2f0").unwrap().allocated);
    assert_eq!(handler.resources().get_free_eths(FABRIC), vec!["eth2f1"]);
}

#[tokio::test]
async fn test_release_of_unbound_device_is_noop() {
    let (control, mut handler) = setup(2).await;
    control.attach("eth2f0", DeviceType::Direct, vnic());
    handler.sync_devices().await.unwrap();

    let stranger = ScannedDevice {
        dev: "eth2f1".to_string(),
        dev_type: DeviceType::Direct,
        mac: Some(vnic()),
        fabric: Some(FABRIC.to_string()),
    };
    assert!(!handler.is_bound(&stranger));
    assert!(!handler.release_device(&stranger));
    assert_eq!(
        handler.registry(FABRIC).unwrap().get_dev_for_vnic(vnic()),
        Some("eth2f0")
    );
}

#[tokio::test]
async fn test_set_vlan_without_netdev_fails_early() {
    let control = Arc::new(RecordingControl::new());
    control.set_vfs("eth3", vec![VfInfo::new(0, "0000:04:00.1", None)]);
    let mut handler = EswitchHandler::new(control.clone());
    handler
        .add_fabrics(&[(FABRIC.to_string(), "eth3".to_string())])
        .await
        .unwrap();

    handler.create_port(FABRIC, DeviceType::Hostdev, None, vnic());
    let result = handler
        .set_vlan(FABRIC, vnic(), VlanTag::new(100).unwrap())
        .await;

    assert!(matches!(result, Err(EswitchError::DeviceNotFound { .. })));
    assert!(control.ops().is_empty());
    assert_eq!(handler.registry(FABRIC).unwrap().get_vlan(vnic()), None);
}

#[tokio::test]
async fn test_allocation_exhaustion_is_not_fatal() {
    let (_, mut handler) = setup(1).await;
    let other: MacAddress = "00:00:00:00:aa:cc".parse().unwrap();

    assert!(handler
        .create_port(FABRIC, DeviceType::Direct, None, vnic())
        .is_some());
    assert_eq!(
        handler.create_port(FABRIC, DeviceType::Direct, None, other),
        None
    );
    assert_eq!(
        handler.create_port(FABRIC, DeviceType::Hostdev, None, other),
        None
    );

    handler.delete_port(FABRIC, vnic());
    assert_eq!(
        handler.create_port(FABRIC, DeviceType::Hostdev, None, other),
        Some("0000:03:00.1".to_string())
    );
}

#[tokio::test]
async fn test_get_vnics_across_fabrics() {
    let (control, mut handler) = setup(2).await;
    control.set_vfs("eth3", vec![VfInfo::new(0, "0000:04:00.1", Some("eth3f0"))]);
    handler.set_fabric_mapping("F2", "eth3").await.unwrap();

    let other: MacAddress = "00:00:00:00:aa:cc".parse().unwrap();
    handler.create_port(FABRIC, DeviceType::Direct, None, vnic());
    handler.create_port("F2", DeviceType::Direct, None, other);

    let vnics = handler.get_vnics(&["F1".to_string(), "F2".to_string(), "F3".to_string()]);
    assert_eq!(vnics.len(), 2);
    assert_eq!(vnics[&vnic()], "eth2f0");
    assert_eq!(vnics[&other], "eth3f0");
}
