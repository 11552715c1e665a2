//! Minimal variable data (CI 0x72) walker.
//!
//! Only what the `request` command needs: the 12-byte header and a split of
//! the record area into raw records. Value/unit interpretation is left to
//! downstream consumers.

use crate::constants::{
    MBUS_DATA_RECORD_DIF_MASK_DATA, MBUS_DATA_VARIABLE_HEADER_LENGTH, MBUS_DIB_DIF_EXTENSION_BIT,
    MBUS_DIB_DIF_IDLE_FILLER, MBUS_DIB_DIF_MANUFACTURER_SPECIFIC,
    MBUS_DIB_DIF_MORE_RECORDS_FOLLOW, MBUS_DIB_VIF_EXTENSION_BIT, MBUS_DIB_VIF_PLAIN_TEXT,
    MBUS_DIB_VIF_WITHOUT_EXTENSION,
};
use crate::error::MBusError;
use crate::mbus::secondary_addressing::SecondaryAddress;
use nom::bytes::complete::take;
use nom::number::complete::{le_u16, u8 as be_u8};
use nom::sequence::tuple;
use nom::IResult;

/// Header preceding the records of a variable data response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDataHeader {
    pub secondary_address: SecondaryAddress,
    pub access_number: u8,
    pub status: u8,
    pub signature: u16,
}

impl VariableDataHeader {
    /// The 8 digit identification number.
    pub fn identification(&self) -> &str {
        &self.secondary_address.as_str()[..8]
    }

    pub fn manufacturer_id(&self) -> u16 {
        u16::from_str_radix(&self.secondary_address.as_str()[8..12], 16).unwrap_or(0)
    }

    pub fn version(&self) -> u8 {
        u8::from_str_radix(&self.secondary_address.as_str()[12..14], 16).unwrap_or(0)
    }

    pub fn medium(&self) -> u8 {
        u8::from_str_radix(&self.secondary_address.as_str()[14..16], 16).unwrap_or(0)
    }
}

/// Converts a manufacturer ID back to its three letter code:
/// `id = (c1 - 64) * 32^2 + (c2 - 64) * 32 + (c3 - 64)`.
pub fn id_to_manufacturer(id: u16) -> String {
    [10u16, 5, 0]
        .iter()
        .map(|shift| char::from((((id >> shift) & 0x1F) as u8).wrapping_add(64)))
        .collect()
}

/// One raw data record: DIB, VIB and data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub dif: u8,
    pub dife: Vec<u8>,
    pub vif: u8,
    pub vife: Vec<u8>,
    pub data: Vec<u8>,
}

impl RawRecord {
    /// Little-endian integer value for records of up to 4 data bytes
    /// (DIF data field 1..=4). BCD and real encodings yield `None`.
    pub fn value_u32(&self) -> Option<u32> {
        match self.dif & MBUS_DATA_RECORD_DIF_MASK_DATA {
            0x01..=0x04 => Some(
                self.data
                    .iter()
                    .rev()
                    .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
            ),
            _ => None,
        }
    }
}

/// Uses the `nom` crate to parse the fixed part of a variable data response.
pub fn parse_variable_header(input: &[u8]) -> IResult<&[u8], VariableDataHeader> {
    let (input, address_bytes) = take(8usize)(input)?;
    let (input, (access_number, status, signature)) = tuple((be_u8, be_u8, le_u16))(input)?;

    let secondary_address = SecondaryAddress::from_bytes(address_bytes).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;

    Ok((
        input,
        VariableDataHeader {
            secondary_address,
            access_number,
            status,
            signature,
        },
    ))
}

/// Number of data bytes implied by the DIF data field. Variable length
/// (0x0D) is resolved from the LVAR byte by the caller.
fn data_length(dif: u8) -> usize {
    match dif & MBUS_DATA_RECORD_DIF_MASK_DATA {
        0x00 | 0x08 => 0,
        0x01 | 0x09 => 1,
        0x02 | 0x0A => 2,
        0x03 | 0x0B => 3,
        0x04 | 0x05 | 0x0C => 4,
        0x06 | 0x0E => 6,
        0x07 => 8,
        _ => 0,
    }
}

fn take_extensions(input: &[u8], first: u8, extension_bit: u8) -> Result<(&[u8], Vec<u8>), MBusError> {
    let mut rest = input;
    let mut out = Vec::new();
    let mut more = first & extension_bit != 0;
    while more {
        let (&byte, tail) = rest
            .split_first()
            .ok_or_else(|| MBusError::FrameParseError("Premature end of data".to_string()))?;
        if out.len() >= 10 {
            return Err(MBusError::FrameParseError("Too many extension bytes".to_string()));
        }
        out.push(byte);
        more = byte & extension_bit != 0;
        rest = tail;
    }
    Ok((rest, out))
}

fn take_bytes(input: &[u8], n: usize) -> Result<(&[u8], Vec<u8>), MBusError> {
    if input.len() < n {
        return Err(MBusError::FrameParseError("Premature end of data".to_string()));
    }
    Ok((&input[n..], input[..n].to_vec()))
}

/// Splits the record area of a variable data response into raw records.
///
/// Idle fillers are skipped. A manufacturer specific DIF (0x0F/0x1F) ends
/// the walk since everything after it is opaque.
pub fn split_records(mut input: &[u8]) -> Result<Vec<RawRecord>, MBusError> {
    let mut records = Vec::new();

    while let Some((&dif, rest)) = input.split_first() {
        if dif == MBUS_DIB_DIF_IDLE_FILLER {
            input = rest;
            continue;
        }
        if dif == MBUS_DIB_DIF_MANUFACTURER_SPECIFIC || dif == MBUS_DIB_DIF_MORE_RECORDS_FOLLOW {
            break;
        }

        let (rest, dife) = take_extensions(rest, dif, MBUS_DIB_DIF_EXTENSION_BIT)?;
        let (&vif, rest) = rest
            .split_first()
            .ok_or_else(|| MBusError::FrameParseError("Premature end of data".to_string()))?;
        let (mut rest, vife) = take_extensions(rest, vif, MBUS_DIB_VIF_EXTENSION_BIT)?;

        if vif & MBUS_DIB_VIF_WITHOUT_EXTENSION == MBUS_DIB_VIF_PLAIN_TEXT {
            let (&len, tail) = rest
                .split_first()
                .ok_or_else(|| MBusError::FrameParseError("Premature end of data".to_string()))?;
            rest = take_bytes(tail, usize::from(len))?.0;
        }

        let length = if dif & MBUS_DATA_RECORD_DIF_MASK_DATA == 0x0D {
            let (&lvar, tail) = rest
                .split_first()
                .ok_or_else(|| MBusError::FrameParseError("Premature end of data".to_string()))?;
            rest = tail;
            match lvar {
                0x00..=0xBF => usize::from(lvar),
                0xC0..=0xCF => usize::from(lvar - 0xC0) * 2,
                0xD0..=0xDF => usize::from(lvar - 0xD0) * 2,
                0xE0..=0xEF => usize::from(lvar - 0xE0),
                _ => usize::from(lvar - 0xF0) * 8,
            }
        } else {
            data_length(dif)
        };

        let (rest, data) = take_bytes(rest, length)?;
        records.push(RawRecord {
            dif,
            dife,
            vif,
            vife,
            data,
        });
        input = rest;
    }

    Ok(records)
}

/// Header plus records of a variable data response body.
pub fn parse_variable_data(data: &[u8]) -> Result<(VariableDataHeader, Vec<RawRecord>), MBusError> {
    if data.len() < MBUS_DATA_VARIABLE_HEADER_LENGTH {
        return Err(MBusError::FrameParseError(
            "Variable data header too short".to_string(),
        ));
    }
    let (rest, header) =
        parse_variable_header(data).map_err(|e| MBusError::FrameParseError(e.to_string()))?;
    let records = split_records(rest)?;
    Ok((header, records))
}
