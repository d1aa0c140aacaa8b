//! Tracing subscriber setup for the `labctl` binary.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to every target.

use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if present and valid, else `level`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global fmt subscriber. Calling it twice is harmless.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .try_init();
}
