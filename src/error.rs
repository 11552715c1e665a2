//! # M-Bus Error Handling
//!
//! This module defines the error types of the mbus-master crate.
//!
//! Receive timeouts are not errors. They are carried by
//! [`RecvResult::Timeout`](crate::mbus::transport::RecvResult).

use crate::mbus::frame::MBusFrame;
use thiserror::Error;

/// Represents the transport, codec and argument errors of the M-Bus crate.
#[derive(Debug, Error)]
pub enum MBusError {
    /// Indicates an error related to the serial port communication.
    #[error("Serial port error: {0}")]
    SerialPortError(String),

    /// Indicates an error when parsing an M-Bus frame.
    #[error("Error parsing M-Bus frame: {0}")]
    FrameParseError(String),

    /// Indicates a checksum mismatch.
    #[error("Invalid checksum: expected {expected}, calculated {calculated}")]
    InvalidChecksum { expected: u8, calculated: u8 },

    /// Malformed mask or out-of-range address, rejected before any bus I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device registry reached its configured capacity.
    #[error("Device registry full ({0} devices)")]
    RegistryFull(usize),
}

/// Failure of a secondary address selection.
#[derive(Debug, Error)]
pub enum SelectError {
    #[error("address mask [{mask}] matches more than one device")]
    Collision { mask: String },

    #[error("address mask [{mask}] does not match any device")]
    NoMatch { mask: String },

    #[error("failed selecting secondary address [{mask}]: {source}")]
    Transport {
        mask: String,
        #[source]
        source: MBusError,
    },
}

/// Failure of a primary address reassignment, one variant per step.
#[derive(Debug, Error)]
pub enum ReassignError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed initializing M-Bus slaves: {0}")]
    BusInit(#[source] MBusError),

    #[error("failed sending verification ping: {0}")]
    VerifyPing(#[source] MBusError),

    #[error("verification failed, primary address [{0}] already in use")]
    AddressInUse(u8),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("failed setting device [{source_id}] primary address: {error}")]
    Commit {
        source_id: String,
        #[source]
        error: MBusError,
    },

    #[error("no reply from device [{source_id}] after {attempts} attempts")]
    NoReply { source_id: String, attempts: u32 },

    #[error("invalid response from device [{source_id}], expected ACK, got {received}:\n{dump}")]
    ProtocolViolation {
        source_id: String,
        received: String,
        frame: Option<Box<MBusFrame>>,
        dump: String,
    },
}

/// Failure of a data request (the `request` command).
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed initializing M-Bus slaves: {0}")]
    BusInit(#[source] MBusError),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("failed receiving M-Bus response from {address}: no reply")]
    NoReply { address: u8 },

    #[error("failed receiving M-Bus response from {address}: garbled reply")]
    InvalidReply { address: u8 },

    #[error("M-Bus request failed: {0}")]
    Transport(#[source] MBusError),
}

impl From<std::io::Error> for MBusError {
    fn from(err: std::io::Error) -> Self {
        MBusError::SerialPortError(err.to_string())
    }
}

impl From<tokio_serial::Error> for MBusError {
    fn from(err: tokio_serial::Error) -> Self {
        MBusError::SerialPortError(err.to_string())
    }
}
