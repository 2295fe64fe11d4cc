//! Client configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cascade_mux::channel::DummyTrafficConfig;
use serde::{Deserialize, Serialize};

use crate::{ClientError, Result};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CASCADE_CONFIG";

/// Shortest accepted login timeout.
pub const MIN_LOGIN_TIMEOUT_MS: u64 = 1_000;

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Cover traffic settings.
    #[serde(default)]
    pub traffic: TrafficConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Timeout for the whole login, in milliseconds.
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    /// Reconnect when the cascade connection is lost.
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Cap on simultaneously open data channels.
    #[serde(default = "default_max_data_channels")]
    pub max_data_channels: usize,
}

/// Dummy traffic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Send dummy packets on an idle connection.
    #[serde(default = "default_true")]
    pub dummy_traffic_enabled: bool,
    /// Idle time before a dummy packet, in milliseconds. Clamped to
    /// 500..=30000.
    #[serde(default = "default_dummy_interval_ms")]
    pub dummy_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "cascade_mux=debug".
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file. Unset = stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default value functions

fn default_login_timeout_ms() -> u64 {
    30_000
}

fn default_max_data_channels() -> usize {
    cascade_mux::DEFAULT_MAX_DATA_CHANNELS
}

fn default_true() -> bool {
    true
}

fn default_dummy_interval_ms() -> u64 {
    cascade_mux::channel::dummy::DEFAULT_DUMMY_INTERVAL_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            login_timeout_ms: default_login_timeout_ms(),
            auto_reconnect: false,
            max_data_channels: default_max_data_channels(),
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            dummy_traffic_enabled: true,
            dummy_interval_ms: default_dummy_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from `path`, or from the file named by
    /// `CASCADE_CONFIG` when set.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match std::env::var_os(CONFIG_ENV_VAR) {
            Some(p) => Some(PathBuf::from(p)),
            None => path.map(Path::to_path_buf),
        };
        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                Self::from_toml_str(&content)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(content).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.connection.login_timeout_ms < MIN_LOGIN_TIMEOUT_MS {
            return Err(ClientError::Config(format!(
                "login_timeout_ms must be at least {MIN_LOGIN_TIMEOUT_MS}"
            )));
        }
        if self.connection.max_data_channels == 0 {
            return Err(ClientError::Config("max_data_channels must be positive".into()));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ClientError::Config("logging level must not be empty".into()));
        }
        Ok(())
    }

    /// Login timeout as a duration.
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.login_timeout_ms)
    }

    /// Dummy traffic timing for new connections.
    pub fn dummy_traffic(&self) -> DummyTrafficConfig {
        if self.traffic.dummy_traffic_enabled {
            DummyTrafficConfig::new(self.traffic.dummy_interval_ms)
        } else {
            DummyTrafficConfig::disabled()
        }
    }
}
