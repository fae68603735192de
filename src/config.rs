//! WolfBalance Configuration
//!
//! This module provides configuration structures for the WolfBalance
//! write-replicating load balancer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfBalance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Backend databases, in order. The position of an entry is the
    /// backend's identity everywhere else (backlog file included).
    pub backends: Vec<BackendConfig>,

    /// Backlog persistence configuration
    #[serde(default)]
    pub backlog: BacklogConfig,

    /// Routing configuration
    #[serde(default)]
    pub balancer: RoutingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for one backend database
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    /// PostgreSQL host
    pub host: String,

    /// PostgreSQL port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database name
    pub database: String,

    /// Database user
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Backlog persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    /// Snapshot file holding statements pending for unreachable backends
    #[serde(default = "default_backlog_path")]
    pub path: PathBuf,

    /// How often the snapshot is rewritten when it has changed
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Minimum time between two reconnection passes over inactive backends
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_db_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_backlog_path() -> PathBuf {
    PathBuf::from("queries.json")
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            path: default_backlog_path(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackendConfig {
    /// Human readable target, without credentials
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl BalancerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: BalancerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.backends.is_empty() {
            return Err(crate::Error::Config("at least one backend is required".into()));
        }

        for (index, backend) in self.backends.iter().enumerate() {
            if backend.host.is_empty() {
                return Err(crate::Error::Config(format!("backends[{}].host cannot be empty", index)));
            }
            if backend.database.is_empty() {
                return Err(crate::Error::Config(format!("backends[{}].database cannot be empty", index)));
            }
            if backend.user.is_empty() {
                return Err(crate::Error::Config(format!("backends[{}].user cannot be empty", index)));
            }
        }

        if self.backlog.flush_interval_ms == 0 {
            return Err(crate::Error::Config("backlog.flush_interval_ms must be positive".into()));
        }

        if self.balancer.reconnect_interval_ms == 0 {
            return Err(crate::Error::Config("balancer.reconnect_interval_ms must be positive".into()));
        }

        if self.backlog.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("backlog.path cannot be empty".into()));
        }

        Ok(())
    }

    /// Get backlog flush interval as Duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.backlog.flush_interval_ms)
    }

    /// Get reconnection interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.balancer.reconnect_interval_ms)
    }

    /// Sample configuration with three local backends
    pub fn sample() -> Self {
        let backends = ["baza1", "baza2", "baza3"]
            .iter()
            .map(|db| BackendConfig {
                host: "localhost".to_string(),
                port: default_db_port(),
                database: db.to_string(),
                user: "postgres".to_string(),
                password: "change_me".to_string(),
                connect_timeout_secs: default_connect_timeout(),
            })
            .collect();

        Self {
            backends,
            backlog: BacklogConfig::default(),
            balancer: RoutingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
