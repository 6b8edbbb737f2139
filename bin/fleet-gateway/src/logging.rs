//! Logging setup

use crate::config::LogFormat;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Initialize logging. `RUST_LOG` wins over the configured level.
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Text => fmt().with_env_filter(filter).with_target(true).init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
    }
}
