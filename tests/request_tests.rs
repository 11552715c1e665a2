//! Integration tests for data requests.

mod support;

use mbus_master::constants::MBUS_CONTROL_INFO_RESP_VARIABLE;
use mbus_master::payload::parse_variable_data;
use mbus_master::{AddressSource, MBusMaster, RequestError, SelectError};
use support::{SimDevice, SimulatedBus};

const METER: &str = "12345678ABCD0107";

#[tokio::test]
async fn test_request_by_primary() {
    let mut master = MBusMaster::new(SimulatedBus::new(vec![SimDevice::new(9, METER)]));

    let reply = master.request(&AddressSource::Primary(9)).await.unwrap();
    assert_eq!(reply.control_information, MBUS_CONTROL_INFO_RESP_VARIABLE);

    let (header, records) = parse_variable_data(&reply.data).unwrap();
    assert_eq!(header.secondary_address.as_str(), METER);
    assert_eq!(records[0].value_u32(), Some(9));
}

#[tokio::test]
async fn test_request_by_secondary_mask() {
    let mut master = MBusMaster::new(SimulatedBus::new(vec![
        SimDevice::new(0, METER),
        SimDevice::new(0, "87654321ABCD0107"),
    ]));

    let source = AddressSource::parse("8765FFFFFFFFFFFF").unwrap();
    let reply = master.request(&source).await.unwrap();
    let (header, _) = parse_variable_data(&reply.data).unwrap();
    assert_eq!(header.identification(), "87654321");
}

#[tokio::test]
async fn test_request_no_reply() {
    let mut master = MBusMaster::new(SimulatedBus::new(vec![SimDevice::new(9, METER)]));
    let result = master.request(&AddressSource::Primary(10)).await;
    assert!(matches!(result, Err(RequestError::NoReply { address: 10 })));
}

#[tokio::test]
async fn test_request_colliding_primary() {
    let mut master = MBusMaster::new(SimulatedBus::new(vec![
        SimDevice::new(4, METER),
        SimDevice::new(4, "87654321ABCD0107"),
    ]));
    let result = master.request(&AddressSource::Primary(4)).await;
    assert!(matches!(result, Err(RequestError::InvalidReply { address: 4 })));
}

#[tokio::test]
async fn test_request_mask_without_match() {
    let mut master = MBusMaster::new(SimulatedBus::new(vec![SimDevice::new(4, METER)]));
    let source = AddressSource::parse("99999999FFFFFFFF").unwrap();
    let result = master.request(&source).await;
    assert!(matches!(
        result,
        Err(RequestError::Select(SelectError::NoMatch { .. }))
    ));
}
