//! Secondary Addressing Implementation for M-Bus (EN 13757-2 Section 5.3)
//!
//! A secondary address is written as 16 hex characters:
//!
//! ```text
//! IIIIIIII MMMM VV DD
//! │        │    │  └─ medium (device type)
//! │        │    └──── version
//! │        └───────── manufacturer code
//! └────────────────── identification number (BCD)
//! ```
//!
//! A [`SecondaryMask`] has the same shape but an `F` in any position is a
//! wildcard nibble. On the wire the identification number travels as
//! little-endian BCD and the manufacturer code as a little-endian word.

use crate::constants::{
    MBUS_ADDRESS_NETWORK_LAYER, MBUS_CONTROL_INFO_SELECT_SLAVE, MBUS_CONTROL_MASK_FCB,
    MBUS_CONTROL_MASK_SND_UD, MBUS_SECONDARY_ADDRESS_LENGTH, MBUS_SECONDARY_WILDCARD_MASK,
};
use crate::error::MBusError;
use crate::mbus::frame::MBusFrame;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const WILDCARD: u8 = b'F';

/// Positions of the identification number, BCD digits only.
const ID_DIGITS: usize = 8;

const BCD_CANDIDATES: &[u8] = b"0123456789";
const HEX_CANDIDATES: &[u8] = b"0123456789ABCDE";

/// Returns `true` when `s` is a well-formed secondary address or mask:
/// exactly 16 hex characters.
pub fn is_secondary_address(s: &str) -> bool {
    s.len() == MBUS_SECONDARY_ADDRESS_LENGTH && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn normalize(s: &str, what: &str) -> Result<String, MBusError> {
    let s = s.trim();
    if !is_secondary_address(s) {
        return Err(MBusError::InvalidArgument(format!(
            "malformed {what} [{s}], must be 16 char HEX number"
        )));
    }
    Ok(s.to_ascii_uppercase())
}

/// Concrete 8-byte secondary address as reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SecondaryAddress(String);

impl SecondaryAddress {
    pub fn parse(s: &str) -> Result<Self, MBusError> {
        normalize(s, "secondary address").map(SecondaryAddress)
    }

    /// Builds the address from the first 8 bytes of a variable data header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MBusError> {
        if data.len() < 8 {
            return Err(MBusError::FrameParseError(
                "Secondary address requires 8 bytes".to_string(),
            ));
        }

        let manufacturer = u16::from_le_bytes([data[4], data[5]]);
        Ok(SecondaryAddress(format!(
            "{:02X}{:02X}{:02X}{:02X}{:04X}{:02X}{:02X}",
            data[3], data[2], data[1], data[0], manufacturer, data[6], data[7]
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wildcard match, position by position.
    pub fn matches(&self, mask: &SecondaryMask) -> bool {
        self.0
            .bytes()
            .zip(mask.0.bytes())
            .all(|(a, m)| m == WILDCARD || a == m)
    }
}

impl fmt::Display for SecondaryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SecondaryAddress {
    type Err = MBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validated selection mask; `F` marks a wildcard nibble.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecondaryMask(String);

impl SecondaryMask {
    /// Validates `s` before it is allowed anywhere near the bus.
    pub fn parse(s: &str) -> Result<Self, MBusError> {
        normalize(s, "secondary address mask").map(SecondaryMask)
    }

    /// The mask matching every device on the bus.
    pub fn wildcard() -> Self {
        SecondaryMask(MBUS_SECONDARY_WILDCARD_MASK.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Index of the first wildcard at or after `from`.
    pub fn next_wildcard(&self, from: usize) -> Option<usize> {
        self.0
            .bytes()
            .enumerate()
            .skip(from)
            .find(|&(_, b)| b == WILDCARD)
            .map(|(i, _)| i)
    }

    /// Copy of this mask with position `pos` fixed to `digit`.
    pub fn with_digit(&self, pos: usize, digit: u8) -> Self {
        let mut bytes = self.0.clone().into_bytes();
        bytes[pos] = digit.to_ascii_uppercase();
        SecondaryMask(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Concrete values tried at `pos` while narrowing a collision. The
    /// identification number is BCD; elsewhere `F` cannot be tried because it
    /// is the wildcard itself.
    pub fn candidate_digits(pos: usize) -> &'static [u8] {
        if pos < ID_DIGITS {
            BCD_CANDIDATES
        } else {
            HEX_CANDIDATES
        }
    }

    /// The 8 data bytes of a selection frame.
    pub fn to_select_bytes(&self) -> [u8; 8] {
        let digits = self.0.as_bytes();
        let nibble = |c: u8| -> u8 {
            match c {
                b'0'..=b'9' => c - b'0',
                b'A'..=b'F' => c - b'A' + 10,
                _ => 0x0F,
            }
        };
        let byte_at = |i: usize| (nibble(digits[i]) << 4) | nibble(digits[i + 1]);

        let mut data = [0u8; 8];
        // Identification number, little-endian BCD with F nibbles as wildcards
        for k in 0..4 {
            data[3 - k] = byte_at(2 * k);
        }
        // Manufacturer word, little-endian
        data[5] = byte_at(8);
        data[4] = byte_at(10);
        data[6] = byte_at(12);
        data[7] = byte_at(14);
        data
    }
}

impl fmt::Display for SecondaryMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SecondaryMask {
    type Err = MBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Packs a select frame for secondary address selection.
pub fn pack_select_frame(mask: &SecondaryMask) -> MBusFrame {
    MBusFrame::long(
        MBUS_CONTROL_MASK_SND_UD | MBUS_CONTROL_MASK_FCB,
        MBUS_ADDRESS_NETWORK_LAYER,
        MBUS_CONTROL_INFO_SELECT_SLAVE,
        mask.to_select_bytes().to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mask_validation() {
        assert!(SecondaryMask::parse("FFFFFFFFFFFFFFFF").is_ok());
        assert!(SecondaryMask::parse("12345678abcd0107").is_ok());
        assert!(SecondaryMask::parse("FFFFFFFFFFFFFFF").is_err());
        assert!(SecondaryMask::parse("FFFFFFFFFFFFFFFFF").is_err());
        assert!(SecondaryMask::parse("FFFFFFFFFFFFFFFG").is_err());
        assert!(matches!(
            SecondaryMask::parse("12"),
            Err(MBusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mask_is_uppercased() {
        let mask = SecondaryMask::parse("12345678abcd0107").unwrap();
        assert_eq!(mask.as_str(), "12345678ABCD0107");
    }

    #[test]
    fn test_select_bytes_layout() {
        let mask = SecondaryMask::parse("12345678ABCD0107").unwrap();
        assert_eq!(
            mask.to_select_bytes(),
            [0x78, 0x56, 0x34, 0x12, 0xCD, 0xAB, 0x01, 0x07]
        );
    }

    #[test]
    fn test_select_bytes_wildcards() {
        let mask = SecondaryMask::parse("1FFFFFFFFFFFFFFF").unwrap();
        assert_eq!(
            mask.to_select_bytes(),
            [0xFF, 0xFF, 0xFF, 0x1F, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_address_from_bytes_matches_select_layout() {
        let bytes = [0x78, 0x56, 0x34, 0x12, 0xCD, 0xAB, 0x01, 0x07];
        let addr = SecondaryAddress::from_bytes(&bytes).unwrap();
        assert_eq!(addr.as_str(), "12345678ABCD0107");
        assert_eq!(SecondaryMask::parse(addr.as_str()).unwrap().to_select_bytes(), bytes);
    }

    #[test]
    fn test_address_from_short_data() {
        assert!(SecondaryAddress::from_bytes(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        let addr = SecondaryAddress::parse("12345678ABCD0107").unwrap();
        assert!(addr.matches(&SecondaryMask::wildcard()));
        assert!(addr.matches(&SecondaryMask::parse("1234FFFFFFFFFFFF").unwrap()));
        assert!(!addr.matches(&SecondaryMask::parse("1235FFFFFFFFFFFF").unwrap()));
    }

    #[test]
    fn test_wildcard_narrowing_helpers() {
        let mask = SecondaryMask::parse("12FFFFFFFFFFFFFF").unwrap();
        assert_eq!(mask.next_wildcard(0), Some(2));
        assert_eq!(mask.next_wildcard(5), Some(5));
        let narrowed = mask.with_digit(2, b'7');
        assert_eq!(narrowed.as_str(), "127FFFFFFFFFFFFF");
        assert_eq!(SecondaryMask::parse("0000000000000000").unwrap().next_wildcard(0), None);
        assert_eq!(SecondaryMask::candidate_digits(0).len(), 10);
        assert_eq!(SecondaryMask::candidate_digits(8).len(), 15);
    }

    #[test]
    fn test_select_frame() {
        let frame = pack_select_frame(&SecondaryMask::parse("12345678ABCD0107").unwrap());
        assert_eq!(frame.control, 0x73);
        assert_eq!(frame.address, 0xFD);
        assert_eq!(frame.control_information, 0x52);
        assert_eq!(frame.data.len(), 8);
        assert!(crate::mbus::frame::verify_frame(&frame).is_ok());
    }

    proptest! {
        #[test]
        fn prop_any_16_hex_chars_is_a_mask(s in "[0-9a-fA-F]{16}") {
            prop_assert!(SecondaryMask::parse(&s).is_ok());
        }

        #[test]
        fn prop_wrong_length_is_rejected(s in "[0-9A-F]{0,15}|[0-9A-F]{17,24}") {
            prop_assert!(SecondaryMask::parse(&s).is_err());
        }

        #[test]
        fn prop_non_hex_char_is_rejected(
            prefix in "[0-9A-F]{0,15}",
            bad in "[G-Zg-z!#*]",
        ) {
            let mut s = prefix.clone();
            s.push_str(&bad);
            while s.len() < 16 {
                s.push('F');
            }
            prop_assert!(SecondaryMask::parse(&s).is_err());
        }
    }
}
