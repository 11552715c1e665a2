//! M-Bus Protocol Constants
//!
//! This module defines the addresses, control codes and limits used by the
//! master, based on the EN 13757-2 link layer.

// ----------------------------------------------------------------------------
// Frame delimiters
// ----------------------------------------------------------------------------

pub const MBUS_FRAME_ACK_START: u8 = 0xE5;
pub const MBUS_FRAME_SHORT_START: u8 = 0x10;
pub const MBUS_FRAME_LONG_START: u8 = 0x68;
pub const MBUS_FRAME_STOP: u8 = 0x16;

/// L field value of a control frame (C + A + CI, no user data)
pub const MBUS_FRAME_CONTROL_LENGTH: u8 = 3;

// ----------------------------------------------------------------------------
// Addresses
// ----------------------------------------------------------------------------

/// Highest primary address a slave may hold.
pub const MBUS_MAX_PRIMARY_SLAVES: u8 = 250;

/// Network layer (secondary addressing) pseudo address
pub const MBUS_ADDRESS_NETWORK_LAYER: u8 = 0xFD;

/// Broadcast, no slave replies
pub const MBUS_ADDRESS_BROADCAST_NOREPLY: u8 = 0xFF;

// ----------------------------------------------------------------------------
// Control field (C) values, master to slave
// ----------------------------------------------------------------------------

pub const MBUS_CONTROL_MASK_SND_NKE: u8 = 0x40;
pub const MBUS_CONTROL_MASK_SND_UD: u8 = 0x53; // includes DIR M2S
pub const MBUS_CONTROL_MASK_REQ_UD2: u8 = 0x5B; // includes DIR M2S
pub const MBUS_CONTROL_MASK_RSP_UD: u8 = 0x08; // S2M response

pub const MBUS_CONTROL_MASK_FCB: u8 = 0x20;

// ----------------------------------------------------------------------------
// Control information (CI) codes
// ----------------------------------------------------------------------------

pub const MBUS_CONTROL_INFO_DATA_SEND: u8 = 0x51;
pub const MBUS_CONTROL_INFO_SELECT_SLAVE: u8 = 0x52;
pub const MBUS_CONTROL_INFO_RESP_VARIABLE: u8 = 0x72;

// ----------------------------------------------------------------------------
// Data records
// ----------------------------------------------------------------------------

/// DIF 8-bit integer, used by the set-primary-address record
pub const MBUS_DIF_8_BIT_INTEGER: u8 = 0x01;

/// VIF "bus address"
pub const MBUS_VIF_BUS_ADDRESS: u8 = 0x7A;

/// DIF (Data Information Field) mask for data length
pub const MBUS_DATA_RECORD_DIF_MASK_DATA: u8 = 0x0F;

/// DIF idle filler
pub const MBUS_DIB_DIF_IDLE_FILLER: u8 = 0x2F;

/// DIF manufacturer specific
pub const MBUS_DIB_DIF_MANUFACTURER_SPECIFIC: u8 = 0x0F;

/// DIF more records follow
pub const MBUS_DIB_DIF_MORE_RECORDS_FOLLOW: u8 = 0x1F;

/// DIF extension bit
pub const MBUS_DIB_DIF_EXTENSION_BIT: u8 = 0x80;

/// VIF without extension
pub const MBUS_DIB_VIF_WITHOUT_EXTENSION: u8 = 0x7F;

/// VIF extension bit
pub const MBUS_DIB_VIF_EXTENSION_BIT: u8 = 0x80;

/// Plain-text VIF, the VIF is followed by a length-prefixed ASCII unit
pub const MBUS_DIB_VIF_PLAIN_TEXT: u8 = 0x7C;

/// Length of the variable data header (ident, manufacturer, version,
/// medium, access number, status, signature)
pub const MBUS_DATA_VARIABLE_HEADER_LENGTH: usize = 12;

// ----------------------------------------------------------------------------
// Secondary addressing
// ----------------------------------------------------------------------------

/// Length of a secondary address or mask in hex characters
pub const MBUS_SECONDARY_ADDRESS_LENGTH: usize = 16;

/// Mask matching every secondary address
pub const MBUS_SECONDARY_WILDCARD_MASK: &str = "FFFFFFFFFFFFFFFF";
