//! Integration tests for the secondary address probe and the registry it
//! fills.

mod support;

use mbus_master::constants::{MBUS_CONTROL_INFO_SELECT_SLAVE, MBUS_CONTROL_MASK_SND_NKE};
use mbus_master::{MBusError, MBusMaster, SecondaryMask};
use support::{SimDevice, SimulatedBus};
use tokio_util::sync::CancellationToken;

fn secondaries(master: &MBusMaster<SimulatedBus>) -> Vec<String> {
    master
        .registry()
        .iter()
        .map(|d| d.secondary_address().to_string())
        .collect()
}

#[tokio::test]
async fn test_probe_finds_all_devices() {
    let sim = SimulatedBus::new(vec![
        SimDevice::new(7, "31000002ABCD0107"),
        SimDevice::new(3, "12345678ABCD0107"),
        SimDevice::new(0, "12345679ABCD0207"),
    ]);
    let mut master = MBusMaster::new(sim);

    let registry = master.probe(None, &CancellationToken::new()).await.unwrap();
    assert_eq!(registry.len(), 3);

    // Depth-first with ascending digits
    assert_eq!(
        secondaries(&master),
        vec!["12345678ABCD0107", "12345679ABCD0207", "31000002ABCD0107"]
    );
    let first = &master.registry().devices()[0];
    assert_eq!(first.primary_address(), Some(3));
}

#[tokio::test]
async fn test_probe_with_mask_limits_search() {
    let sim = SimulatedBus::new(vec![
        SimDevice::new(1, "12345678ABCD0107"),
        SimDevice::new(2, "87654321ABCD0107"),
    ]);
    let mut master = MBusMaster::new(sim);

    master
        .probe(Some("1FFFFFFFFFFFFFFF"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(secondaries(&master), vec!["12345678ABCD0107"]);
}

/// Probing twice never duplicates an entry.
#[tokio::test]
async fn test_registry_insert_is_idempotent() {
    let sim = SimulatedBus::new(vec![
        SimDevice::new(1, "12345678ABCD0107"),
        SimDevice::new(2, "22345678ABCD0107"),
    ]);
    let mut master = MBusMaster::new(sim);
    let cancel = CancellationToken::new();
    let mask = SecondaryMask::wildcard();

    master.probe_secondary(&mask, &cancel).await.unwrap();
    master.probe_secondary(&mask, &cancel).await.unwrap();

    assert_eq!(master.registry().len(), 2);
}

/// Malformed masks are rejected before any frame is sent.
#[tokio::test]
async fn test_probe_rejects_malformed_mask() {
    let mut master = MBusMaster::new(SimulatedBus::new(vec![SimDevice::new(
        1,
        "12345678ABCD0107",
    )]));
    let cancel = CancellationToken::new();

    for bad in ["12345678ABCD010", "12345678ABCD01G7", "12345678ABCD01077"] {
        let result = master.probe(Some(bad), &cancel).await;
        assert!(matches!(result, Err(MBusError::InvalidArgument(_))), "{bad}");
    }
    assert!(master.transport().sent.is_empty());
}

/// Two devices sharing one secondary address cannot be isolated.
#[tokio::test]
async fn test_probe_duplicate_secondary_address() {
    let sim = SimulatedBus::new(vec![
        SimDevice::new(1, "12345678ABCD0107"),
        SimDevice::new(2, "12345678ABCD0107"),
        SimDevice::new(3, "99999999ABCD0107"),
    ]);
    let mut master = MBusMaster::new(sim);

    master
        .probe(Some("FFFFFFFFABCD0107"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(secondaries(&master), vec!["99999999ABCD0107"]);
}

/// A cancelled probe stops after bus init.
#[tokio::test]
async fn test_probe_cancelled() {
    let sim = SimulatedBus::new(vec![SimDevice::new(1, "12345678ABCD0107")]);
    let mut master = MBusMaster::new(sim);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let registry = master.probe(None, &cancel).await.unwrap();
    assert!(registry.is_empty());
    assert!(master
        .transport()
        .sent
        .iter()
        .all(|f| f.control == MBUS_CONTROL_MASK_SND_NKE));
}

#[tokio::test]
async fn test_probe_transport_error() {
    let mut sim = SimulatedBus::new(vec![SimDevice::new(1, "12345678ABCD0107")]);
    sim.fail_after = Some(4);
    let mut master = MBusMaster::new(sim);

    let result = master.probe(None, &CancellationToken::new()).await;
    assert!(matches!(result, Err(MBusError::SerialPortError(_))));
}

#[tokio::test]
async fn test_select_single_collision_and_no_match() {
    let sim = SimulatedBus::new(vec![
        SimDevice::new(1, "12345678ABCD0107"),
        SimDevice::new(2, "12345679ABCD0107"),
    ]);
    let mut master = MBusMaster::new(sim);

    let single = SecondaryMask::parse("12345678FFFFFFFF").unwrap();
    assert_eq!(master.select_secondary(&single).await.unwrap(), 0xFD);

    let both = SecondaryMask::parse("1234567FFFFFFFFF").unwrap();
    assert!(matches!(
        master.select_secondary(&both).await,
        Err(mbus_master::SelectError::Collision { .. })
    ));

    let none = SecondaryMask::parse("55555555FFFFFFFF").unwrap();
    assert!(matches!(
        master.select_secondary(&none).await,
        Err(mbus_master::SelectError::NoMatch { .. })
    ));

    let selects = master
        .transport()
        .sent
        .iter()
        .filter(|f| f.control_information == MBUS_CONTROL_INFO_SELECT_SLAVE)
        .count();
    assert_eq!(selects, 3);
}
