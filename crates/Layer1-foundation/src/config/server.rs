//! Server Config - every knob of the function server in one place

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default retention window for finished tasks (one day)
pub const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24;

/// Default per-function timeout (one day)
pub const DEFAULT_FUNCTION_TIMEOUT_SECS: u64 = 60 * 60 * 24;

// ============================================================================
// Shutdown Mode
// ============================================================================

/// How forked workers are treated when the server stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Wait until every worker finishes on its own
    #[default]
    Join,
    /// Kill every worker immediately
    Terminate,
}

impl std::str::FromStr for ShutdownMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "join" => Ok(Self::Join),
            "terminate" => Ok(Self::Terminate),
            other => Err(Error::Config(format!(
                "shutdown_mode should be \"join\" or \"terminate\", got \"{}\"",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

// ============================================================================
// Task Store Settings
// ============================================================================

/// Where and how task records are persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStoreSettings {
    /// SQLite database file, shared by the server and its workers
    pub path: PathBuf,

    /// How long a finished task stays queryable
    pub retention_secs: u64,

    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
}

impl Default for TaskStoreSettings {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("fnjob.db"),
            retention_secs: DEFAULT_RETENTION_SECS,
            busy_timeout_ms: 30_000,
        }
    }
}

impl TaskStoreSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

// ============================================================================
// Server Config
// ============================================================================

/// Function server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// What happens to running workers on shutdown
    pub shutdown_mode: ShutdownMode,

    /// Polling interval of blocking (keep-connection) calls
    pub status_poll_interval_secs: f64,

    /// Interval of the timeout reaper
    pub reaper_interval_secs: f64,

    /// Timeout for functions registered without one
    pub default_timeout_secs: u64,

    /// Install SIGINT/SIGTERM handlers
    pub register_signals: bool,

    /// Verbose logging
    pub debug: bool,

    /// Task store
    pub store: TaskStoreSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            shutdown_mode: ShutdownMode::Join,
            status_poll_interval_secs: 1.0,
            reaper_interval_secs: 60.0,
            default_timeout_secs: DEFAULT_FUNCTION_TIMEOUT_SECS,
            register_signals: true,
            debug: false,
            store: TaskStoreSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        check_interval("status_poll_interval_secs", self.status_poll_interval_secs)?;
        check_interval("reaper_interval_secs", self.reaper_interval_secs)?;
        if self.default_timeout_secs == 0 {
            return Err(Error::Config(
                "default_timeout_secs should be greater than 0".to_string(),
            ));
        }
        if self.store.retention_secs == 0 {
            return Err(Error::Config(
                "store.retention_secs should be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Falls back to the default when the value is not a valid interval
    pub fn status_poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.status_poll_interval_secs)
            .unwrap_or(Duration::from_secs(1))
    }

    /// Falls back to the default when the value is not a valid interval
    pub fn reaper_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.reaper_interval_secs)
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Positive and representable as a `Duration`
fn check_interval(name: &str, secs: f64) -> Result<()> {
    if !(secs > 0.0) {
        return Err(Error::Config(format!("{} should be greater than 0.0", name)));
    }
    if Duration::try_from_secs_f64(secs).is_err() {
        return Err(Error::Config(format!("{} is too large: {}", name, secs)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "0.0.0.0:8888");
        assert_eq!(config.shutdown_mode, ShutdownMode::Join);
        assert_eq!(config.reaper_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_non_positive_intervals() {
        let mut config = ServerConfig::default();
        config.status_poll_interval_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.reaper_interval_secs = -1.0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.store.retention_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_intervals() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"reaper_interval_secs": 1e300}"#).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert_eq!(config.reaper_interval(), Duration::from_secs(60));

        let mut config = ServerConfig::default();
        config.status_poll_interval_secs = f64::INFINITY;
        assert!(config.validate().is_err());
        assert_eq!(config.status_poll_interval(), Duration::from_secs(1));

        let mut config = ServerConfig::default();
        config.status_poll_interval_secs = 0.5;
        assert!(config.validate().is_ok());
        assert_eq!(config.status_poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_shutdown_mode_parse() {
        assert_eq!("join".parse::<ShutdownMode>().unwrap(), ShutdownMode::Join);
        assert_eq!(
            "terminate".parse::<ShutdownMode>().unwrap(),
            ShutdownMode::Terminate
        );
        assert!("kill".parse::<ShutdownMode>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 9000, "shutdown_mode": "terminate"}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.shutdown_mode, ShutdownMode::Terminate);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.store.retention_secs, DEFAULT_RETENTION_SECS);
    }
}
