//! Tests for the logging helpers exported at the crate root.

use mbus_master::{is_verbose, log_error, log_info, log_warn, set_verbose};

/// The `debug` command flips frame tracing through these two calls.
#[test]
fn test_verbose_toggle_and_helpers() {
    set_verbose(true);
    assert!(is_verbose());
    log_info("frame tracing on");

    set_verbose(false);
    assert!(!is_verbose());
    log_warn("frame tracing off");
    log_error("still reported");
}
