//! # mbus-master - A Rust Crate for Wired M-Bus Master Operation
//!
//! The mbus-master crate implements the master side of the wired M-Bus
//! (Meter-Bus, EN 13757) protocol: finding the devices on a bus, telling
//! apart an empty address from two devices answering at once, and assigning
//! primary addresses.
//!
//! ## Features
//!
//! - Bus initialisation (network layer and broadcast SND_NKE)
//! - Primary address sweep (0-250) with collision detection
//! - Secondary address probe by wildcard bisection into a device registry
//! - Secondary address selection
//! - Primary address reassignment with occupancy check and bounded retries
//! - Data requests (REQ_UD2) with a minimal variable data decoder
//! - A [`BusTransport`] seam with a serial implementation and a mock port
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mbus_master::{MBusMaster, SerialTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), mbus_master::MBusError> {
//! let transport = SerialTransport::connect("/dev/ttyUSB0").await?;
//! let mut master = MBusMaster::new(transport);
//!
//! let report = master.scan(&CancellationToken::new()).await?;
//! for address in report.found() {
//!     println!("device at {address}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod device_registry;
pub mod error;
pub mod logging;
pub mod mbus;
pub mod payload;
pub mod util;

pub use crate::device_registry::{Device, DeviceRegistry, Inserted};
pub use crate::error::{MBusError, ReassignError, RequestError, SelectError};
pub use crate::logging::{init_logger, is_verbose, log_error, log_info, log_warn, set_verbose};

// Core M-Bus types
pub use mbus::{
    AddressSource, BusTransport, MBusFrame, MBusFrameType, MBusMaster, MasterConfig, ProbeHit,
    ProbeResult, RecvResult, ScanOutcome, ScanReport, SecondaryAddress, SecondaryMask,
    SerialConfig, SerialTransport,
};
