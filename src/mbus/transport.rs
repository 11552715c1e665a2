//! # Bus Transport Contract
//!
//! The master drives the bus exclusively through [`BusTransport`]. An
//! implementation only has to provide the three raw primitives (send a frame,
//! receive a frame, purge the line); ping, request, address assignment,
//! secondary selection and the wildcard bisection are provided on top of
//! them and may be overridden.
//!
//! Every receive is classified into exactly one [`RecvResult`] variant. The
//! four-way split (frame, silence, garbage, failure) is what lets the master
//! tell an empty address from a bus collision, so it is never collapsed.

use crate::constants::{
    MBUS_ADDRESS_NETWORK_LAYER, MBUS_CONTROL_INFO_RESP_VARIABLE, MBUS_MAX_PRIMARY_SLAVES,
    MBUS_SECONDARY_ADDRESS_LENGTH,
};
use crate::error::MBusError;
use crate::mbus::frame::{ping_frame, request_frame, set_primary_address_frame, MBusFrame, MBusFrameType};
use crate::mbus::secondary_addressing::{pack_select_frame, SecondaryAddress, SecondaryMask};
use crate::payload::record::parse_variable_header;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

/// Outcome of a single receive.
#[derive(Debug)]
pub enum RecvResult {
    /// A well-formed frame with a valid checksum.
    Frame(MBusFrame),
    /// Nothing arrived within the response timeout.
    Timeout,
    /// Something arrived but it was not a valid frame, usually two slaves
    /// talking at once.
    Invalid,
    /// The line itself failed.
    Error(MBusError),
}

/// Outcome of a secondary address selection or probe.
#[derive(Debug)]
pub enum ProbeResult {
    /// Exactly one device matched the mask and is now selected.
    Single,
    /// More than one device matched.
    Collision,
    /// No device matched.
    Nothing,
    Error(MBusError),
}

/// A device resolved by a secondary probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHit {
    pub secondary_address: SecondaryAddress,
    /// Primary address from the A field of the device's reply, when it is a
    /// valid slave address.
    pub primary_address: Option<u8>,
    /// The mask that isolated the device.
    pub mask: SecondaryMask,
}

/// Reads the secondary address out of a variable data response.
pub fn secondary_address_from_reply(frame: &MBusFrame) -> Result<SecondaryAddress, MBusError> {
    if frame.frame_type != MBusFrameType::Long
        || frame.control_information != MBUS_CONTROL_INFO_RESP_VARIABLE
    {
        return Err(MBusError::FrameParseError(format!(
            "expected variable data response, got {:?} frame with CI 0x{:02X}",
            frame.frame_type, frame.control_information
        )));
    }

    parse_variable_header(&frame.data)
        .map(|(_, header)| header.secondary_address)
        .map_err(|e| MBusError::FrameParseError(e.to_string()))
}

/// Primitive operations of a master on a half-duplex M-Bus line.
///
/// All methods take `&mut self`: only one request/response exchange may be
/// outstanding on the bus at any time.
#[async_trait]
pub trait BusTransport: Send {
    /// Writes one frame to the line.
    async fn send_frame(&mut self, frame: &MBusFrame) -> Result<(), MBusError>;

    /// Waits for one frame or the response timeout.
    async fn recv_frame(&mut self) -> RecvResult;

    /// Discards anything still arriving on the line. Returns `true` when
    /// something was discarded.
    async fn purge_pending(&mut self) -> bool;

    /// SND_NKE to `address`. With `purge_response` any replies are drained
    /// right away, which is what broadcast resets want.
    async fn send_ping(&mut self, address: u8, purge_response: bool) -> Result<(), MBusError> {
        self.send_frame(&ping_frame(address)).await?;
        if purge_response {
            self.purge_pending().await;
        }
        Ok(())
    }

    /// REQ_UD2 to `address`.
    async fn send_request(&mut self, address: u8) -> Result<(), MBusError> {
        self.send_frame(&request_frame(address)).await
    }

    /// Tells the device at `current` to move to primary address `next`.
    async fn send_set_primary_address(&mut self, current: u8, next: u8) -> Result<(), MBusError> {
        self.send_frame(&set_primary_address_frame(current, next)).await
    }

    /// Selects the devices matching `mask` for network layer addressing.
    async fn select_secondary(&mut self, mask: &SecondaryMask) -> ProbeResult {
        if let Err(e) = self.send_frame(&pack_select_frame(mask)).await {
            return ProbeResult::Error(e);
        }

        match self.recv_frame().await {
            RecvResult::Timeout => ProbeResult::Nothing,
            RecvResult::Invalid => {
                self.purge_pending().await;
                ProbeResult::Collision
            }
            RecvResult::Error(e) => ProbeResult::Error(e),
            RecvResult::Frame(frame) if frame.is_ack() => {
                // A second answer behind the ACK means two devices matched
                if self.purge_pending().await {
                    ProbeResult::Collision
                } else {
                    ProbeResult::Single
                }
            }
            RecvResult::Frame(frame) => {
                warn!(
                    "unexpected {:?} frame in reply to selection of [{mask}]",
                    frame.frame_type
                );
                ProbeResult::Nothing
            }
        }
    }

    /// Selects `mask` and, on a single match, reads the device's full
    /// secondary address. Selection is retried while nothing answers, up to
    /// `max_search_retry` extra attempts.
    async fn probe_secondary(
        &mut self,
        mask: &SecondaryMask,
        max_search_retry: u32,
    ) -> (ProbeResult, Option<ProbeHit>) {
        let mut result = ProbeResult::Nothing;

        for _ in 0..=max_search_retry {
            result = self.select_secondary(mask).await;
            match result {
                ProbeResult::Single => {}
                ProbeResult::Nothing => continue,
                ProbeResult::Collision | ProbeResult::Error(_) => break,
            }

            if let Err(e) = self.send_request(MBUS_ADDRESS_NETWORK_LAYER).await {
                return (ProbeResult::Error(e), None);
            }

            return match self.recv_frame().await {
                RecvResult::Timeout => (ProbeResult::Nothing, None),
                RecvResult::Invalid => {
                    self.purge_pending().await;
                    (ProbeResult::Collision, None)
                }
                RecvResult::Error(e) => (ProbeResult::Error(e), None),
                RecvResult::Frame(reply) => match secondary_address_from_reply(&reply) {
                    Ok(secondary_address) => {
                        let primary_address =
                            (reply.address <= MBUS_MAX_PRIMARY_SLAVES).then_some(reply.address);
                        (
                            ProbeResult::Single,
                            Some(ProbeHit {
                                secondary_address,
                                primary_address,
                                mask: mask.clone(),
                            }),
                        )
                    }
                    Err(e) => {
                        warn!("unexpected reply for address mask [{mask}]: {e}");
                        (ProbeResult::Nothing, None)
                    }
                },
            };
        }

        (result, None)
    }

    /// Depth-first bisection of the wildcard positions of `mask`. Every
    /// device that can be isolated is reported through `on_found`; a
    /// collision narrows the next wildcard position. Stops early, without
    /// error, once `cancel` fires.
    async fn probe_secondary_range(
        &mut self,
        mask: &SecondaryMask,
        max_search_retry: u32,
        cancel: &CancellationToken,
        on_found: &mut (dyn FnMut(ProbeHit) + Send),
    ) -> Result<(), MBusError> {
        let mut stack: Vec<(SecondaryMask, usize)> = Vec::new();
        match mask.next_wildcard(0) {
            Some(pos) => push_narrowed(&mut stack, mask, pos),
            None => stack.push((mask.clone(), MBUS_SECONDARY_ADDRESS_LENGTH)),
        }

        while let Some((candidate, pos)) = stack.pop() {
            if cancel.is_cancelled() {
                info!("secondary address probe cancelled");
                break;
            }

            let (result, hit) = self.probe_secondary(&candidate, max_search_retry).await;
            match result {
                ProbeResult::Single => {
                    if let Some(hit) = hit {
                        debug!(
                            "found {} using address mask [{}]",
                            hit.secondary_address, hit.mask
                        );
                        on_found(hit);
                    }
                }
                ProbeResult::Nothing => {}
                ProbeResult::Collision => match candidate.next_wildcard(pos + 1) {
                    Some(next) => push_narrowed(&mut stack, &candidate, next),
                    None => warn!("collision on concrete address [{candidate}], duplicate secondary address on the bus"),
                },
                ProbeResult::Error(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Pushes the narrowed children of `mask` at `pos` so they pop in ascending
/// digit order.
fn push_narrowed(stack: &mut Vec<(SecondaryMask, usize)>, mask: &SecondaryMask, pos: usize) {
    for &digit in SecondaryMask::candidate_digits(pos).iter().rev() {
        stack.push((mask.with_digit(pos, digit), pos));
    }
}
