//! # M-Bus Master
//!
//! This module provides the master side of the wired M-Bus protocol on top of
//! any [`BusTransport`]: bus initialisation, the primary address sweep, the
//! secondary address probe feeding the [`DeviceRegistry`], secondary
//! selection, primary address reassignment and data requests.
//!
//! Every operation takes `&mut self`, so exactly one exchange is on the wire
//! at any time. Long running sweeps take a [`CancellationToken`] that is
//! checked between addresses.

use crate::constants::{
    MBUS_ADDRESS_BROADCAST_NOREPLY, MBUS_ADDRESS_NETWORK_LAYER, MBUS_MAX_PRIMARY_SLAVES,
};
use crate::device_registry::{Device, DeviceRegistry, Inserted, DEFAULT_REGISTRY_CAPACITY};
use crate::error::{MBusError, ReassignError, RequestError, SelectError};
use crate::mbus::frame::{frame_dump, MBusFrame};
use crate::mbus::retry::{Attempt, RetryError, RetryPolicy};
use crate::mbus::secondary_addressing::{is_secondary_address, SecondaryMask};
use crate::mbus::transport::{BusTransport, ProbeHit, ProbeResult, RecvResult};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Tunables of the master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Extra pings per primary address, and extra selects per mask, after a
    /// timeout.
    pub max_search_retry: u32,
    /// SND_UD attempts when committing a new primary address.
    pub commit_attempts: u32,
    pub registry_capacity: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            max_search_retry: 1,
            commit_attempts: 3,
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

/// Classification of one primary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "address", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Exactly one device acknowledged.
    Found(u8),
    /// Overlapping replies, more than one device answers to this address.
    Collision(u8),
    /// Nothing answered within the retry budget.
    Silent(u8),
}

impl ScanOutcome {
    pub fn address(&self) -> u8 {
        match *self {
            ScanOutcome::Found(a) | ScanOutcome::Collision(a) | ScanOutcome::Silent(a) => a,
        }
    }
}

/// Result of a primary sweep. Silent addresses are not recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub outcomes: Vec<ScanOutcome>,
    /// Number of addresses actually polled.
    pub scanned: usize,
    pub cancelled: bool,
}

impl ScanReport {
    pub fn found(&self) -> impl Iterator<Item = u8> + '_ {
        self.outcomes.iter().filter_map(|o| match o {
            ScanOutcome::Found(a) => Some(*a),
            _ => None,
        })
    }

    pub fn collisions(&self) -> impl Iterator<Item = u8> + '_ {
        self.outcomes.iter().filter_map(|o| match o {
            ScanOutcome::Collision(a) => Some(*a),
            _ => None,
        })
    }
}

/// How a device is addressed by a command: a primary address or a
/// secondary address mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSource {
    Primary(u8),
    Secondary(SecondaryMask),
}

impl AddressSource {
    /// Sixteen hex digits are a secondary mask, anything else must be a
    /// primary address in `0..=250`.
    pub fn parse(s: &str) -> Result<Self, MBusError> {
        let s = s.trim();
        if is_secondary_address(s) {
            return SecondaryMask::parse(s).map(AddressSource::Secondary);
        }

        match s.parse::<u8>() {
            Ok(address) if address <= MBUS_MAX_PRIMARY_SLAVES => Ok(AddressSource::Primary(address)),
            _ => Err(MBusError::InvalidArgument(format!(
                "'{s}' is neither a primary address (0-{MBUS_MAX_PRIMARY_SLAVES}) nor a 16 digit secondary address"
            ))),
        }
    }
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSource::Primary(address) => write!(f, "{address}"),
            AddressSource::Secondary(mask) => write!(f, "{mask}"),
        }
    }
}

/// Reply to a single ping, once a non-timeout result came in.
enum PingReply {
    Frame(MBusFrame),
    Garbled,
}

/// The bus master.
pub struct MBusMaster<T: BusTransport> {
    transport: T,
    registry: DeviceRegistry,
    config: MasterConfig,
}

impl<T: BusTransport> MBusMaster<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, MasterConfig::default())
    }

    pub fn with_config(transport: T, config: MasterConfig) -> Self {
        MBusMaster {
            transport,
            registry: DeviceRegistry::with_capacity(config.registry_capacity),
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Resets the bus: SND_NKE to the network layer address, which deselects
    /// any selected slave, then to the broadcast address. Replies are purged.
    pub async fn init_slaves(&mut self) -> Result<(), MBusError> {
        debug!("initializing M-Bus slaves");
        self.transport
            .send_ping(MBUS_ADDRESS_NETWORK_LAYER, true)
            .await?;
        self.transport
            .send_ping(MBUS_ADDRESS_BROADCAST_NOREPLY, true)
            .await
    }

    /// Pings one primary address and classifies the answer.
    pub async fn ping_address(&mut self, address: u8) -> Result<ScanOutcome, MBusError> {
        let policy = RetryPolicy::new(self.config.max_search_retry.saturating_add(1));
        let reply = policy
            .run(&mut self.transport, move |t, _| {
                Box::pin(async move {
                    if let Err(e) = t.send_ping(address, false).await {
                        return Attempt::Fatal(e);
                    }
                    match t.recv_frame().await {
                        RecvResult::Timeout => Attempt::Retry,
                        RecvResult::Frame(frame) => Attempt::Done(PingReply::Frame(frame)),
                        RecvResult::Invalid => Attempt::Done(PingReply::Garbled),
                        RecvResult::Error(e) => Attempt::Fatal(e),
                    }
                })
            })
            .await;

        match reply {
            Err(RetryError::Exhausted { .. }) => Ok(ScanOutcome::Silent(address)),
            Err(RetryError::Fatal(e)) => Err(e),
            Ok(PingReply::Garbled) => {
                self.transport.purge_pending().await;
                warn!("collision at primary address {address}");
                Ok(ScanOutcome::Collision(address))
            }
            Ok(PingReply::Frame(frame)) if frame.is_ack() => {
                if self.transport.purge_pending().await {
                    warn!("collision at primary address {address}");
                    Ok(ScanOutcome::Collision(address))
                } else {
                    info!("found an M-Bus device at address {address}");
                    Ok(ScanOutcome::Found(address))
                }
            }
            Ok(PingReply::Frame(frame)) => {
                self.transport.purge_pending().await;
                warn!(
                    "ignoring unexpected {:?} frame from primary address {address}",
                    frame.frame_type
                );
                Ok(ScanOutcome::Silent(address))
            }
        }
    }

    /// Pings every primary address from 0 to 250 in order. A transport
    /// failure aborts the sweep; cancellation ends it early with what was
    /// found so far.
    pub async fn scan_primary_range(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, MBusError> {
        let mut report = ScanReport::default();

        for address in 0..=MBUS_MAX_PRIMARY_SLAVES {
            if cancel.is_cancelled() {
                info!("primary scan cancelled before address {address}");
                report.cancelled = true;
                break;
            }

            report.scanned += 1;
            match self.ping_address(address).await? {
                ScanOutcome::Silent(_) => {}
                outcome => report.outcomes.push(outcome),
            }
        }

        Ok(report)
    }

    /// Bus init followed by a primary sweep.
    pub async fn scan(&mut self, cancel: &CancellationToken) -> Result<ScanReport, MBusError> {
        self.init_slaves().await?;
        info!("scanning primary addresses");
        self.scan_primary_range(cancel).await
    }

    /// Bisects `mask` and adds every isolated device to the registry.
    /// Devices already registered are left as they are.
    pub async fn probe_secondary(
        &mut self,
        mask: &SecondaryMask,
        cancel: &CancellationToken,
    ) -> Result<(), MBusError> {
        let registry = &mut self.registry;
        let mut on_found = |hit: ProbeHit| {
            let ProbeHit {
                secondary_address,
                primary_address,
                ..
            } = hit;
            match registry.insert(Device::new(secondary_address.clone(), primary_address)) {
                Ok(Inserted::New) => match primary_address {
                    Some(primary) => info!(
                        "found a device on secondary address {secondary_address} [primary address {primary}]"
                    ),
                    None => info!("found a device on secondary address {secondary_address}"),
                },
                Ok(Inserted::Duplicate) => {
                    debug!("device {secondary_address} already registered")
                }
                Err(e) => warn!("not registering {secondary_address}: {e}"),
            }
        };

        self.transport
            .probe_secondary_range(mask, self.config.max_search_retry, cancel, &mut on_found)
            .await
    }

    /// Validates `mask` (all wildcards when absent), resets the bus and
    /// rebuilds the registry from a secondary probe. A malformed mask is
    /// rejected before anything is sent.
    pub async fn probe(
        &mut self,
        mask: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<&DeviceRegistry, MBusError> {
        let mask = match mask {
            Some(m) => SecondaryMask::parse(m)?,
            None => SecondaryMask::wildcard(),
        };

        self.init_slaves().await?;
        self.registry.clear();
        info!("probing secondary addresses with mask [{mask}]");
        self.probe_secondary(&mask, cancel).await?;
        Ok(&self.registry)
    }

    /// Selects the single device matching `mask`. On success the device
    /// answers on the network layer address, which is returned.
    pub async fn select_secondary(&mut self, mask: &SecondaryMask) -> Result<u8, SelectError> {
        debug!("selecting secondary address [{mask}]");
        match self.transport.select_secondary(mask).await {
            ProbeResult::Single => Ok(MBUS_ADDRESS_NETWORK_LAYER),
            ProbeResult::Collision => Err(SelectError::Collision {
                mask: mask.to_string(),
            }),
            ProbeResult::Nothing => Err(SelectError::NoMatch {
                mask: mask.to_string(),
            }),
            ProbeResult::Error(source) => Err(SelectError::Transport {
                mask: mask.to_string(),
                source,
            }),
        }
    }

    /// Moves the device identified by `source` to primary address
    /// `new_primary`.
    ///
    /// The target address must be silent before anything is changed. The
    /// registry is only updated once the device acknowledged.
    pub async fn reassign(
        &mut self,
        source: &AddressSource,
        new_primary: u8,
    ) -> Result<(), ReassignError> {
        if !(1..=MBUS_MAX_PRIMARY_SLAVES).contains(&new_primary) {
            return Err(ReassignError::InvalidArgument(format!(
                "new primary address {new_primary} out of range 1-{MBUS_MAX_PRIMARY_SLAVES}"
            )));
        }
        if let AddressSource::Primary(current) = source {
            if *current > MBUS_MAX_PRIMARY_SLAVES {
                return Err(ReassignError::InvalidArgument(format!(
                    "primary address {current} out of range 0-{MBUS_MAX_PRIMARY_SLAVES}"
                )));
            }
        }

        self.init_slaves().await.map_err(ReassignError::BusInit)?;

        self.transport
            .send_ping(new_primary, false)
            .await
            .map_err(ReassignError::VerifyPing)?;
        match self.transport.recv_frame().await {
            RecvResult::Timeout => {}
            RecvResult::Error(e) => return Err(ReassignError::VerifyPing(e)),
            RecvResult::Frame(_) | RecvResult::Invalid => {
                self.transport.purge_pending().await;
                return Err(ReassignError::AddressInUse(new_primary));
            }
        }

        let current = match source {
            AddressSource::Primary(current) => *current,
            AddressSource::Secondary(mask) => self.select_secondary(mask).await?,
        };

        let source_id = source.to_string();
        let policy = RetryPolicy::new(self.config.commit_attempts);
        let reply = policy
            .run(&mut self.transport, move |t, attempt| {
                Box::pin(async move {
                    debug!("setting primary address {new_primary}, attempt {attempt}");
                    if let Err(e) = t.send_set_primary_address(current, new_primary).await {
                        return Attempt::Fatal(e);
                    }
                    match t.recv_frame().await {
                        RecvResult::Timeout => Attempt::Retry,
                        RecvResult::Frame(frame) => Attempt::Done(PingReply::Frame(frame)),
                        RecvResult::Invalid => Attempt::Done(PingReply::Garbled),
                        RecvResult::Error(e) => Attempt::Fatal(e),
                    }
                })
            })
            .await;

        match reply {
            Ok(PingReply::Frame(frame)) if frame.is_ack() => {}
            Ok(PingReply::Frame(frame)) => {
                let dump = frame_dump(&frame);
                warn!("invalid response from device [{source_id}], expected ACK:\n{dump}");
                return Err(ReassignError::ProtocolViolation {
                    source_id,
                    received: format!("{:?} frame", frame.frame_type),
                    frame: Some(Box::new(frame)),
                    dump,
                });
            }
            Ok(PingReply::Garbled) => {
                self.transport.purge_pending().await;
                warn!("garbled response from device [{source_id}], expected ACK");
                return Err(ReassignError::ProtocolViolation {
                    source_id,
                    received: "garbled reply".to_string(),
                    frame: None,
                    dump: String::new(),
                });
            }
            Err(RetryError::Fatal(error)) => {
                return Err(ReassignError::Commit { source_id, error });
            }
            Err(RetryError::Exhausted { attempts }) => {
                return Err(ReassignError::NoReply {
                    source_id,
                    attempts,
                });
            }
        }

        self.update_registry_primary(source, new_primary);
        info!("set primary address of device [{source_id}] to {new_primary}");
        Ok(())
    }

    fn update_registry_primary(&mut self, source: &AddressSource, new_primary: u8) {
        let targets: Vec<_> = match source {
            AddressSource::Secondary(mask) => self
                .registry
                .matching(mask)
                .map(|d| d.secondary_address().clone())
                .collect(),
            AddressSource::Primary(current) => self
                .registry
                .with_primary(*current)
                .map(|d| d.secondary_address().clone())
                .collect(),
        };

        // Only an unambiguous match is known to be the device that moved
        if let [address] = targets.as_slice() {
            self.registry.set_primary_address(address, new_primary);
        } else if targets.len() > 1 {
            debug!("{} registry entries match [{source}], not updating", targets.len());
        }
    }

    /// Resets the bus, selects the device when addressed by mask and reads
    /// one REQ_UD2 reply.
    pub async fn request(&mut self, source: &AddressSource) -> Result<MBusFrame, RequestError> {
        self.init_slaves().await.map_err(RequestError::BusInit)?;

        let address = match source {
            AddressSource::Primary(address) => *address,
            AddressSource::Secondary(mask) => self.select_secondary(mask).await?,
        };

        self.transport
            .send_request(address)
            .await
            .map_err(RequestError::Transport)?;
        match self.transport.recv_frame().await {
            RecvResult::Frame(frame) => Ok(frame),
            RecvResult::Timeout => Err(RequestError::NoReply { address }),
            RecvResult::Invalid => {
                self.transport.purge_pending().await;
                Err(RequestError::InvalidReply { address })
            }
            RecvResult::Error(e) => Err(RequestError::Transport(e)),
        }
    }
}
