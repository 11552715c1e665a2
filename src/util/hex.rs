//! # Hex Encoding/Decoding Utilities
//!
//! Hex helpers for frame dumps, traces and raw record values.
//!
//! ```rust
//! use mbus_master::util::hex::{encode_hex_upper, format_hex_compact};
//!
//! assert_eq!(format_hex_compact(&[0x68, 0x03, 0x03, 0x68]), "68 03 03 68");
//! assert_eq!(encode_hex_upper(&[0xbc, 0x0a]), "BC0A");
//! ```

/// Encode bytes to uppercase hex string
pub fn encode_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Pretty-print hex data with offsets and an ASCII column
///
/// Creates a dump similar to `hexdump -C`, used when an unexpected frame
/// has to be shown to the operator.
pub fn pretty_hex(data: &[u8], bytes_per_line: usize) -> String {
    let bytes_per_line = bytes_per_line.max(1);

    data.chunks(bytes_per_line)
        .enumerate()
        .map(|(i, chunk)| {
            let hex = format_hex_compact(chunk);
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            format!(
                "{:04x}: {:<width$} |{}|",
                i * bytes_per_line,
                hex,
                ascii,
                width = bytes_per_line * 3 - 1
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format hex data for compact display (useful for logs)
///
/// Formats data as "68 31 31 68" with spaces between bytes.
pub fn format_hex_compact(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
