//! The mbus module contains the components responsible for the wired M-Bus
//! link layer and the master built on it: frame parsing and packing,
//! secondary addressing, the transport contract with its serial
//! implementation, and the master operations.

pub mod frame;
pub mod mbus_protocol;
pub mod retry;
pub mod secondary_addressing;
pub mod serial;
pub mod serial_mock;
pub mod transport;

pub use frame::*;
pub use mbus_protocol::{AddressSource, MBusMaster, MasterConfig, ScanOutcome, ScanReport};
pub use secondary_addressing::{SecondaryAddress, SecondaryMask};
pub use serial::{SerialConfig, SerialTransport};
pub use transport::{BusTransport, ProbeHit, ProbeResult, RecvResult};
