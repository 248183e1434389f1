//! # Logging Initialization
//!
//! One-shot tracing setup shared by the agent and worker binaries. The
//! filter comes from `RUST_LOG` (default `info`); `LOG_FORMAT=json` switches
//! to newline-delimited JSON for log shippers.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Worker processes log to stderr: stdout carries the wire protocol.
pub fn init_tracing_stderr() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Initialize the global tracing subscriber. Safe to call more than once;
/// only the first call installs anything.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if json {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(false)
                .init();
        } else {
            fmt().with_env_filter(filter).init();
        }
    });
}
