//! Logging setup shared by the relink crates, their tests and any binary
//! embedding them.
//!
//! Every crate in the workspace logs through the [`log`] facade; this crate
//! only decides where those records go. `RUST_LOG` always wins over the
//! built-in defaults.

use {
    env_logger::{Builder, Env},
    log::LevelFilter,
};

/// Default filter used by [`setup`] when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize the global logger with [`DEFAULT_FILTER`].
///
/// Safe to call more than once; only the first call installs a logger.
pub fn setup() {
    setup_with(DEFAULT_FILTER);
}

/// Initialize the global logger with the given default filter
/// (`env_logger` syntax, e.g. `"relink_socket=debug,warn"`).
pub fn setup_with(filter: &str) {
    let _ = Builder::from_env(Env::new().default_filter_or(filter))
        .format_timestamp_millis()
        .try_init();
}

/// Initialize env_logger once for test output.
///
/// Output is captured by the test harness unless `--nocapture` is given.
pub fn setup_for_tests() {
    let mut builder = env_logger::builder();
    builder.is_test(true).filter_level(LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let _ = builder.try_init();
}
