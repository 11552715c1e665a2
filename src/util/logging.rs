//! # Frame Tracing
//!
//! Debug-level hex tracing of every frame crossing the serial line. Enabled
//! with `-d` on the command line or the `debug` shell command.

/// Upper bound on bytes rendered per log line
const MAX_LOG_BYTES: usize = 64;

/// Log frame data in hex format for debugging
///
/// Output is cut after [`MAX_LOG_BYTES`] bytes so a garbled line cannot
/// flood the log.
pub fn log_frame_hex(prefix: &str, data: &[u8]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }

    let display_data = &data[..data.len().min(MAX_LOG_BYTES)];
    let hex_str = crate::util::hex::format_hex_compact(display_data);
    let suffix = if data.len() > MAX_LOG_BYTES {
        format!(" ... ({} bytes total)", data.len())
    } else {
        String::new()
    };

    log::debug!("{prefix}: {hex_str}{suffix}");
}
