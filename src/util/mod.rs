//! # Utility Modules
//!
//! Hex formatting and frame tracing helpers shared by the transport and the
//! command shell.

pub mod hex;
pub mod logging;

pub use hex::{encode_hex_upper, format_hex_compact, pretty_hex};
pub use logging::log_frame_hex;
