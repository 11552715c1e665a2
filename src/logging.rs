use log::{error, info, log_enabled, warn, Level, LevelFilter};

/// Initializes the logger with the `env_logger` crate.
///
/// Without `RUST_LOG` the level starts at `info`, or `debug` when `verbose`,
/// and can be changed later with [`set_verbose`]. An explicit `RUST_LOG`
/// takes precedence.
pub fn init_logger(verbose: bool) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format_timestamp(None)
        .init();

    if std::env::var_os("RUST_LOG").is_none() {
        set_verbose(verbose);
    }
}

/// Raises or lowers the global log level at runtime (the `debug` command).
pub fn set_verbose(verbose: bool) {
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}

/// Whether frame level tracing is currently visible.
pub fn is_verbose() -> bool {
    log::max_level() >= LevelFilter::Debug
}

/// Logs an error message.
pub fn log_error(message: &str) {
    if log_enabled!(Level::Error) {
        error!("{message}");
    }
}

/// Logs a warning message.
pub fn log_warn(message: &str) {
    if log_enabled!(Level::Warn) {
        warn!("{message}");
    }
}

/// Logs an informational message.
pub fn log_info(message: &str) {
    if log_enabled!(Level::Info) {
        info!("{message}");
    }
}
