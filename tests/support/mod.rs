//! Simulated wired M-Bus segment for the integration tests.
//!
//! Devices answer pings, selections, data requests and address changes the
//! way real slaves do. Several devices answering at once produce an ACK with
//! trailing bytes (what a purge then finds) or a garbled long frame.

#![allow(dead_code)]

use async_trait::async_trait;
use mbus_master::constants::{
    MBUS_ADDRESS_BROADCAST_NOREPLY, MBUS_ADDRESS_NETWORK_LAYER, MBUS_CONTROL_INFO_DATA_SEND,
    MBUS_CONTROL_INFO_RESP_VARIABLE, MBUS_CONTROL_INFO_SELECT_SLAVE, MBUS_CONTROL_MASK_REQ_UD2,
    MBUS_CONTROL_MASK_RSP_UD, MBUS_CONTROL_MASK_SND_NKE, MBUS_CONTROL_MASK_SND_UD,
};
use mbus_master::mbus::frame::{MBusFrame, MBusFrameType};
use mbus_master::{BusTransport, MBusError, RecvResult, SecondaryAddress, SecondaryMask};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// How a device answers a primary address change.
#[derive(Debug, Clone)]
pub enum CommitReply {
    Ack,
    Frame(MBusFrame),
}

#[derive(Debug, Clone)]
pub struct SimDevice {
    pub primary: u8,
    pub secondary: SecondaryAddress,
    /// Address change requests silently dropped before the device answers.
    pub commit_timeouts: u32,
    pub commit_reply: CommitReply,
}

impl SimDevice {
    pub fn new(primary: u8, secondary: &str) -> Self {
        SimDevice {
            primary,
            secondary: SecondaryAddress::parse(secondary).unwrap(),
            commit_timeouts: 0,
            commit_reply: CommitReply::Ack,
        }
    }

    pub fn with_commit_timeouts(mut self, n: u32) -> Self {
        self.commit_timeouts = n;
        self
    }

    pub fn with_commit_reply(mut self, reply: CommitReply) -> Self {
        self.commit_reply = reply;
        self
    }

    /// RSP_UD carrying the 12 byte variable data header and one record.
    fn data_response(&self) -> MBusFrame {
        let s = self.secondary.as_str();
        let byte = |i: usize| u8::from_str_radix(&s[i..i + 2], 16).unwrap();

        let mut data = vec![byte(6), byte(4), byte(2), byte(0), byte(10), byte(8), byte(12), byte(14)];
        data.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0x01, 0x7A, self.primary]);
        MBusFrame::long(
            MBUS_CONTROL_MASK_RSP_UD,
            self.primary,
            MBUS_CONTROL_INFO_RESP_VARIABLE,
            data,
        )
    }
}

/// Rebuilds the mask string from the 8 data bytes of a selection frame.
fn mask_from_select(data: &[u8]) -> SecondaryMask {
    let text = format!(
        "{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        data[3], data[2], data[1], data[0], data[5], data[4], data[6], data[7]
    );
    SecondaryMask::parse(&text).unwrap()
}

#[derive(Default)]
pub struct SimulatedBus {
    pub devices: Vec<SimDevice>,
    pub sent: Vec<MBusFrame>,
    pending: VecDeque<RecvResult>,
    trailing: bool,
    selected: Vec<usize>,
    /// Sends fail once this many frames went out.
    pub fail_after: Option<usize>,
    /// Cancels the token while pinging the given primary address.
    pub cancel_at: Option<(u8, CancellationToken)>,
}

impl SimulatedBus {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        SimulatedBus {
            devices,
            ..Default::default()
        }
    }

    pub fn device(&self, secondary: &str) -> &SimDevice {
        self.devices
            .iter()
            .find(|d| d.secondary.as_str() == secondary)
            .unwrap()
    }

    /// Frames sent with control field `control`.
    pub fn sent_with_control(&self, control: u8) -> Vec<&MBusFrame> {
        self.sent.iter().filter(|f| f.control == control).collect()
    }

    /// Ping count per primary address.
    pub fn pings_to(&self, address: u8) -> usize {
        self.sent
            .iter()
            .filter(|f| f.control == MBUS_CONTROL_MASK_SND_NKE && f.address == address)
            .count()
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    fn addressed(&self, address: u8) -> Vec<usize> {
        if address == MBUS_ADDRESS_NETWORK_LAYER {
            return self.selected.clone();
        }
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.primary == address)
            .map(|(i, _)| i)
            .collect()
    }

    fn answer_ack(&mut self, responders: usize) {
        match responders {
            0 => {}
            1 => self.pending.push_back(RecvResult::Frame(MBusFrame::ack())),
            _ => {
                self.pending.push_back(RecvResult::Frame(MBusFrame::ack()));
                self.trailing = true;
            }
        }
    }

    fn handle(&mut self, frame: &MBusFrame) {
        match (frame.frame_type, frame.control) {
            (MBusFrameType::Short, MBUS_CONTROL_MASK_SND_NKE) => {
                if let Some((address, token)) = &self.cancel_at {
                    if *address == frame.address {
                        token.cancel();
                    }
                }
                let responders = match frame.address {
                    MBUS_ADDRESS_NETWORK_LAYER | MBUS_ADDRESS_BROADCAST_NOREPLY => {
                        let selected = self.selected.len();
                        self.selected.clear();
                        if frame.address == MBUS_ADDRESS_NETWORK_LAYER {
                            selected
                        } else {
                            0
                        }
                    }
                    address => self.addressed(address).len(),
                };
                self.answer_ack(responders);
            }
            (MBusFrameType::Short, MBUS_CONTROL_MASK_REQ_UD2) => {
                match self.addressed(frame.address).as_slice() {
                    [] => {}
                    [single] => {
                        let reply = self.devices[*single].data_response();
                        self.pending.push_back(RecvResult::Frame(reply));
                    }
                    _ => {
                        self.pending.push_back(RecvResult::Invalid);
                        self.trailing = true;
                    }
                }
            }
            (MBusFrameType::Long, control)
                if control & !0x20 == MBUS_CONTROL_MASK_SND_UD
                    && frame.control_information == MBUS_CONTROL_INFO_SELECT_SLAVE =>
            {
                let mask = mask_from_select(&frame.data);
                self.selected = self
                    .devices
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.secondary.matches(&mask))
                    .map(|(i, _)| i)
                    .collect();
                self.answer_ack(self.selected.len());
            }
            (MBusFrameType::Long, MBUS_CONTROL_MASK_SND_UD)
                if frame.control_information == MBUS_CONTROL_INFO_DATA_SEND =>
            {
                let new_primary = frame.data[2];
                match self.addressed(frame.address).as_slice() {
                    [] => {}
                    [single] => {
                        let device = &mut self.devices[*single];
                        if device.commit_timeouts > 0 {
                            device.commit_timeouts -= 1;
                            return;
                        }
                        match device.commit_reply.clone() {
                            CommitReply::Ack => {
                                device.primary = new_primary;
                                self.pending.push_back(RecvResult::Frame(MBusFrame::ack()));
                            }
                            CommitReply::Frame(reply) => {
                                self.pending.push_back(RecvResult::Frame(reply));
                            }
                        }
                    }
                    _ => {
                        self.pending.push_back(RecvResult::Invalid);
                        self.trailing = true;
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl BusTransport for SimulatedBus {
    async fn send_frame(&mut self, frame: &MBusFrame) -> Result<(), MBusError> {
        if let Some(limit) = self.fail_after {
            if self.sent.len() >= limit {
                return Err(MBusError::SerialPortError("line down".to_string()));
            }
        }

        self.sent.push(frame.clone());
        self.pending.clear();
        self.trailing = false;
        self.handle(frame);
        Ok(())
    }

    async fn recv_frame(&mut self) -> RecvResult {
        self.pending.pop_front().unwrap_or(RecvResult::Timeout)
    }

    async fn purge_pending(&mut self) -> bool {
        let purged = self.trailing || !self.pending.is_empty();
        self.pending.clear();
        self.trailing = false;
        purged
    }
}
