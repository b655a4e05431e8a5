//! Logging setup for pgmetrics-core
//!
//! This is a library embedded in a host process, not a standalone app, so
//! there is no rolling file appender here: the host decides where lines
//! end up. `init` wires a global fmt subscriber for hosts that want one;
//! `init_test` is for this crate's own test modules.

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::config::LoggingConfig;

/// Install a process-wide fmt subscriber driven by `config.level`, or by
/// `RUST_LOG` if the environment variable is set.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    tracing::info!(level = %config.level, "pgmetrics-core logging initialized");
}

/// Initialize logging for this crate's own tests (logs to stdout, scoped
/// to the test harness rather than the process).
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}
