//! Log output setup.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::{ClientError, Result};

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => {
            EnvFilter::try_new(directives).map_err(|e| ClientError::Config(format!("RUST_LOG: {e}")))
        }
        _ => EnvFilter::try_new(&config.level).map_err(|e| ClientError::Config(format!("logging level: {e}"))),
    }
}

/// Install the global `tracing` subscriber.
///
/// Fails if the filter is invalid, the log file cannot be opened or a
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = filter(config)?;
    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    installed.map_err(|e| ClientError::Config(format!("logging: {e}")))
}
