//! # M-Bus Frame Codec
//!
//! Parsing and packing of the four EN 13757-2 link layer frame formats, using
//! `nom` for the decoder:
//!
//! | format  | layout                                        |
//! |---------|-----------------------------------------------|
//! | ACK     | `E5`                                          |
//! | short   | `10 C A CS 16`                                |
//! | control | `68 03 03 68 C A CI CS 16`                    |
//! | long    | `68 L L 68 C A CI data.. CS 16`               |
//!
//! The checksum is the byte sum of C, A, CI and the user data.
//!
//! ```ignore
//! let frame = ping_frame(5);
//! let bytes = pack_frame(&frame);
//! assert_eq!(bytes, [0x10, 0x40, 0x05, 0x45, 0x16]);
//!
//! let (_, parsed) = parse_frame(&bytes).unwrap();
//! verify_frame(&parsed).unwrap();
//! ```

use crate::constants::{
    MBUS_CONTROL_INFO_DATA_SEND, MBUS_CONTROL_MASK_REQ_UD2, MBUS_CONTROL_MASK_SND_NKE,
    MBUS_CONTROL_MASK_SND_UD, MBUS_DIF_8_BIT_INTEGER, MBUS_FRAME_ACK_START,
    MBUS_FRAME_CONTROL_LENGTH, MBUS_FRAME_LONG_START, MBUS_FRAME_SHORT_START, MBUS_FRAME_STOP,
    MBUS_VIF_BUS_ADDRESS,
};
use crate::error::MBusError;
use crate::util::hex::pretty_hex;
use bytes::{BufMut, BytesMut};
use nom::bytes::complete::{tag, take};
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::u8 as be_u8;
use nom::sequence::tuple;
use nom::IResult;

const STOP: &[u8] = &[MBUS_FRAME_STOP];
const LONG_START: &[u8] = &[MBUS_FRAME_LONG_START];

/// Represents an M-Bus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MBusFrame {
    pub frame_type: MBusFrameType,
    pub control: u8,
    pub address: u8,
    pub control_information: u8,
    pub data: Vec<u8>,
    pub checksum: u8,
}

/// Represents the different types of M-Bus frames.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MBusFrameType {
    Ack,
    Short,
    Control,
    Long,
}

impl MBusFrame {
    /// Single character acknowledgement.
    pub fn ack() -> Self {
        MBusFrame {
            frame_type: MBusFrameType::Ack,
            control: 0,
            address: 0,
            control_information: 0,
            data: Vec::new(),
            checksum: 0,
        }
    }

    /// Short frame with the checksum filled in.
    pub fn short(control: u8, address: u8) -> Self {
        let mut frame = MBusFrame {
            frame_type: MBusFrameType::Short,
            control,
            address,
            control_information: 0,
            data: Vec::new(),
            checksum: 0,
        };
        frame.checksum = calculate_checksum(&frame);
        frame
    }

    /// Long frame (or control frame when `data` is empty) with the checksum
    /// filled in.
    pub fn long(control: u8, address: u8, control_information: u8, data: Vec<u8>) -> Self {
        let frame_type = if data.is_empty() {
            MBusFrameType::Control
        } else {
            MBusFrameType::Long
        };
        let mut frame = MBusFrame {
            frame_type,
            control,
            address,
            control_information,
            data,
            checksum: 0,
        };
        frame.checksum = calculate_checksum(&frame);
        frame
    }

    pub fn is_ack(&self) -> bool {
        self.frame_type == MBusFrameType::Ack
    }
}

/// SND_NKE: link reset, answered with an ACK by an addressed slave.
pub fn ping_frame(address: u8) -> MBusFrame {
    MBusFrame::short(MBUS_CONTROL_MASK_SND_NKE, address)
}

/// REQ_UD2: request class 2 user data.
pub fn request_frame(address: u8) -> MBusFrame {
    MBusFrame::short(MBUS_CONTROL_MASK_REQ_UD2, address)
}

/// SND_UD carrying a single "bus address" record with the new primary
/// address.
pub fn set_primary_address_frame(current: u8, next: u8) -> MBusFrame {
    MBusFrame::long(
        MBUS_CONTROL_MASK_SND_UD,
        current,
        MBUS_CONTROL_INFO_DATA_SEND,
        vec![MBUS_DIF_8_BIT_INTEGER, MBUS_VIF_BUS_ADDRESS, next],
    )
}

/// Uses the `nom` crate to parse an M-Bus frame from a byte slice.
///
/// Structure (start/stop bytes, repeated length) is checked here; the
/// checksum is left to [`verify_frame`].
pub fn parse_frame(input: &[u8]) -> IResult<&[u8], MBusFrame> {
    let (input, start) = be_u8(input)?;

    match start {
        MBUS_FRAME_ACK_START => Ok((input, MBusFrame::ack())),
        MBUS_FRAME_SHORT_START => {
            let (input, (control, address, checksum)) = tuple((be_u8, be_u8, be_u8))(input)?;
            let (input, _) = tag(STOP)(input)?;
            Ok((
                input,
                MBusFrame {
                    frame_type: MBusFrameType::Short,
                    control,
                    address,
                    control_information: 0,
                    data: Vec::new(),
                    checksum,
                },
            ))
        }
        MBUS_FRAME_LONG_START => {
            let (input, (length1, length2)) = tuple((be_u8, be_u8))(input)?;
            if length1 != length2 || length1 < MBUS_FRAME_CONTROL_LENGTH {
                return Err(nom::Err::Error(NomError::new(input, ErrorKind::Verify)));
            }
            let (input, _) = tag(LONG_START)(input)?;
            let (input, (control, address, control_information)) =
                tuple((be_u8, be_u8, be_u8))(input)?;
            let payload_len = usize::from(length1 - MBUS_FRAME_CONTROL_LENGTH);
            let (input, data) = take(payload_len)(input)?;
            let (input, checksum) = be_u8(input)?;
            let (input, _) = tag(STOP)(input)?;

            let frame_type = if length1 == MBUS_FRAME_CONTROL_LENGTH {
                MBusFrameType::Control
            } else {
                MBusFrameType::Long
            };
            Ok((
                input,
                MBusFrame {
                    frame_type,
                    control,
                    address,
                    control_information,
                    data: data.to_vec(),
                    checksum,
                },
            ))
        }
        _ => Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag))),
    }
}

/// Packs an M-Bus frame into its wire representation.
pub fn pack_frame(frame: &MBusFrame) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(frame.data.len() + 9);

    match frame.frame_type {
        MBusFrameType::Ack => buf.put_u8(MBUS_FRAME_ACK_START),
        MBusFrameType::Short => {
            buf.put_u8(MBUS_FRAME_SHORT_START);
            buf.put_u8(frame.control);
            buf.put_u8(frame.address);
            buf.put_u8(frame.checksum);
            buf.put_u8(MBUS_FRAME_STOP);
        }
        MBusFrameType::Control | MBusFrameType::Long => {
            let length = (frame.data.len() as u8).wrapping_add(MBUS_FRAME_CONTROL_LENGTH);
            buf.put_u8(MBUS_FRAME_LONG_START);
            buf.put_u8(length);
            buf.put_u8(length);
            buf.put_u8(MBUS_FRAME_LONG_START);
            buf.put_u8(frame.control);
            buf.put_u8(frame.address);
            buf.put_u8(frame.control_information);
            buf.put_slice(&frame.data);
            buf.put_u8(frame.checksum);
            buf.put_u8(MBUS_FRAME_STOP);
        }
    }

    buf.to_vec()
}

/// Verifies the integrity of an M-Bus frame.
pub fn verify_frame(frame: &MBusFrame) -> Result<(), MBusError> {
    let calculated = calculate_checksum(frame);
    if frame.checksum != calculated {
        return Err(MBusError::InvalidChecksum {
            expected: frame.checksum,
            calculated,
        });
    }
    Ok(())
}

/// Calculates the checksum of an M-Bus frame.
pub fn calculate_checksum(frame: &MBusFrame) -> u8 {
    match frame.frame_type {
        MBusFrameType::Ack => 0,
        MBusFrameType::Short => frame.control.wrapping_add(frame.address),
        MBusFrameType::Control | MBusFrameType::Long => frame
            .data
            .iter()
            .fold(
                frame
                    .control
                    .wrapping_add(frame.address)
                    .wrapping_add(frame.control_information),
                |acc, b| acc.wrapping_add(*b),
            ),
    }
}

/// Human readable dump of a frame for operator inspection.
pub fn frame_dump(frame: &MBusFrame) -> String {
    let bytes = pack_frame(frame);
    format!(
        "{:?} frame, C=0x{:02X} A={} CI=0x{:02X}, {} bytes:\n{}",
        frame.frame_type,
        frame.control,
        frame.address,
        frame.control_information,
        bytes.len(),
        pretty_hex(&bytes, 16)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_frame_bytes() {
        assert_eq!(pack_frame(&ping_frame(5)), vec![0x10, 0x40, 0x05, 0x45, 0x16]);
    }

    #[test]
    fn test_request_frame_bytes() {
        assert_eq!(
            pack_frame(&request_frame(0xFD)),
            vec![0x10, 0x5B, 0xFD, 0x58, 0x16]
        );
    }

    #[test]
    fn test_set_primary_address_frame_bytes() {
        let bytes = pack_frame(&set_primary_address_frame(0xFD, 17));
        // C + A + CI + 01 7A 11 = 0x53 + 0xFD + 0x51 + 0x01 + 0x7A + 0x11
        assert_eq!(
            bytes,
            vec![0x68, 0x06, 0x06, 0x68, 0x53, 0xFD, 0x51, 0x01, 0x7A, 0x11, 0x2D, 0x16]
        );
    }

    #[test]
    fn test_parse_ack() {
        let (rest, frame) = parse_frame(&[0xE5]).unwrap();
        assert!(rest.is_empty());
        assert!(frame.is_ack());
    }

    #[test]
    fn test_parse_long_frame() {
        let bytes = [0x68, 0x06, 0x06, 0x68, 0x08, 0x05, 0x72, 0x01, 0x02, 0x03, 0x85, 0x16];
        let (rest, frame) = parse_frame(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(frame.frame_type, MBusFrameType::Long);
        assert_eq!(frame.address, 0x05);
        assert_eq!(frame.control_information, 0x72);
        assert_eq!(frame.data, vec![0x01, 0x02, 0x03]);
        assert!(verify_frame(&frame).is_ok());
    }

    #[test]
    fn test_parse_control_frame() {
        let bytes = [0x68, 0x03, 0x03, 0x68, 0x53, 0x01, 0x51, 0xA5, 0x16];
        let (_, frame) = parse_frame(&bytes).unwrap();
        assert_eq!(frame.frame_type, MBusFrameType::Control);
        assert!(verify_frame(&frame).is_ok());
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let bytes = [0x68, 0x06, 0x05, 0x68, 0x08, 0x05, 0x72, 0x01, 0x02, 0x03, 0x85, 0x16];
        assert!(parse_frame(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_stop() {
        assert!(parse_frame(&[0x10, 0x40, 0x05, 0x45, 0x17]).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_start() {
        assert!(parse_frame(&[0xFF, 0x00]).is_err());
    }

    #[test]
    fn test_verify_detects_bad_checksum() {
        let (_, frame) = parse_frame(&[0x10, 0x40, 0x05, 0x46, 0x16]).unwrap();
        assert!(matches!(
            verify_frame(&frame),
            Err(MBusError::InvalidChecksum {
                expected: 0x46,
                calculated: 0x45
            })
        ));
    }

    #[test]
    fn test_frame_dump_mentions_type() {
        let dump = frame_dump(&MBusFrame::short(0x08, 3));
        assert!(dump.starts_with("Short frame"));
        assert!(dump.contains("10 08 03 0b 16"));
    }
}
