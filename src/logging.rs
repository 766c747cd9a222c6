//! Logging setup shared by the binaries.

use env_logger::Env;

/// Initialise `env_logger` with `default_filter` unless `RUST_LOG` is set.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_filter: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}
