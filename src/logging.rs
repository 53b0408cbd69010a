//! Logging setup
//!
//! The library only emits `tracing` events. Binaries and tests that want to
//! see them call [`init`] once; the filter comes from `SHARDANN_LOG`:
//!
//! - `SHARDANN_LOG=info` - default
//! - `SHARDANN_LOG=shardann::fanout=debug` - per-module
//! - `SHARDANN_LOG=warn,shardann::pipeline=info` - combined
//!
//! ```ignore
//! shardann::logging::init();
//! ```

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read for the log filter
pub const LOG_ENV: &str = "SHARDANN_LOG";

/// Install the global subscriber at `info` unless `SHARDANN_LOG` says otherwise.
pub fn init() {
    init_with_default("info");
}

/// Install the global subscriber with `default_level` as fallback filter.
///
/// A second call is a no-op (only one global subscriber is allowed).
pub fn init_with_default(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = subscriber.try_init();
}

/// Subscriber for tests: writes through the test harness capture.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
