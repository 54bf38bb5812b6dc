use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{debug, trace, warn};

use crate::incident::DEFAULT_FAILURE_THRESHOLD;
use crate::monitor::MonitorConfig;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none", alias = "memory")]
    None,

    /// SQLite database, also used as monitor registry
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (check results older than this are deleted)
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./apiwatch.db")
}

fn default_retention_days() -> u32 {
    30
}

/// Scheduler and prober settings
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Consecutive failures that open an incident
    pub failure_threshold: usize,

    /// Upper bound for probes in flight across all monitors
    pub max_concurrent_probes: usize,

    /// Seconds between two full registry refreshes
    pub registry_refresh_secs: u64,

    /// TCP connect timeout, capped at each monitor's own timeout
    pub connect_timeout_secs: u64,

    pub user_agent: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_concurrent_probes: 64,
            registry_refresh_secs: 30,
            connect_timeout_secs: 5,
            user_agent: format!("apiwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Live broadcast settings
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Outbound messages buffered per observer before it gets dropped
    pub connection_buffer: usize,

    pub heartbeat_interval_secs: u64,

    /// Observers silent for longer than this are evicted
    pub heartbeat_timeout_secs: u64,

    /// Capacity of the internal event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            connection_buffer: 64,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            event_channel_capacity: 1024,
        }
    }
}

/// Observer API settings
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,

    /// Bearer token required on every request when set
    pub auth_token: Option<String>,

    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_token: None,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub checker: CheckerConfig,

    #[serde(default)]
    pub live: LiveConfig,

    /// Storage configuration (defaults to SQLite)
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub api: ApiConfig,

    /// Monitors seeded into the registry
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Apply `APIWATCH_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("APIWATCH_DB_PATH") {
            debug!("overriding database path from environment");
            self.storage = match &self.storage {
                StorageConfig::Sqlite { retention_days, .. } => StorageConfig::Sqlite {
                    path: PathBuf::from(path),
                    retention_days: *retention_days,
                },
                StorageConfig::None => StorageConfig::Sqlite {
                    path: PathBuf::from(path),
                    retention_days: default_retention_days(),
                },
            };
        }

        if let Some(addr) = lookup("APIWATCH_BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => self.api.bind_addr = addr,
                Err(e) => warn!("ignoring invalid APIWATCH_BIND_ADDR '{addr}': {e}"),
            }
        }

        if let Some(token) = lookup("APIWATCH_AUTH_TOKEN") {
            self.api.auth_token = (!token.is_empty()).then_some(token);
        }

        if let Some(threshold) = lookup("APIWATCH_FAILURE_THRESHOLD") {
            match threshold.parse() {
                Ok(threshold) => self.checker.failure_threshold = threshold,
                Err(e) => warn!("ignoring invalid APIWATCH_FAILURE_THRESHOLD '{threshold}': {e}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checker.failure_threshold == 0 {
            return Err(ConfigError("checker.failure_threshold must be at least 1".into()));
        }
        if self.checker.max_concurrent_probes == 0 {
            return Err(ConfigError(
                "checker.max_concurrent_probes must be at least 1".into(),
            ));
        }
        if self.checker.registry_refresh_secs == 0 {
            return Err(ConfigError(
                "checker.registry_refresh_secs must be at least 1".into(),
            ));
        }
        if self.live.connection_buffer == 0 || self.live.event_channel_capacity == 0 {
            return Err(ConfigError("live buffers must hold at least 1 message".into()));
        }
        if self.live.heartbeat_interval_secs == 0
            || self.live.heartbeat_timeout_secs <= self.live.heartbeat_interval_secs
        {
            return Err(ConfigError(
                "live.heartbeat_timeout_secs must exceed a non-zero heartbeat_interval_secs".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for monitor in &self.monitors {
            monitor.validate().map_err(ConfigError)?;
            if !seen.insert(monitor.id) {
                return Err(ConfigError(format!("duplicate monitor id {}", monitor.id)));
            }
        }

        Ok(())
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    let mut config: Config = serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;

    config.apply_env_overrides();
    config.validate()?;

    trace!("loaded config: {config:?}");
    Ok(config)
}
