//! Structured logging setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `fmt` subscriber. `RUST_LOG` wins over `fallback`.
pub fn init(fallback: &str) {
    // Re-initialization (tests, embedding apps) is not an error worth surfacing.
    let _ = try_init(fallback);
}

pub fn try_init(fallback: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(fallback))?;
    fmt().with_env_filter(filter).with_target(true).try_init()
}
