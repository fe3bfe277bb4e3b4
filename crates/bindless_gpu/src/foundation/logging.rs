//! Logging utilities and structured logging support

pub use log::{debug, error, info, trace, warn};

use crate::config::DeviceConfig;

/// Initialize the logging system with the `RUST_LOG` filter, defaulting to `info`
pub fn init() {
    init_with_level("info");
}

/// Initialize the logging system with a default filter used when `RUST_LOG` is unset
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_level(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    if env_logger::Builder::from_env(env).try_init().is_err() {
        log::trace!("Logger already initialized");
    }
}

/// Initialize the logging system from a device configuration
pub fn init_from_config(config: &DeviceConfig) {
    init_with_level(&config.log_level);
}
