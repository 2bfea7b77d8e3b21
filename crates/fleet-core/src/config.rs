//! fleet.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults
//! below.
//!
//! ```toml
//! [daemon]
//! data_dir = "/var/lib/fleet"
//!
//! [rollout]
//! poll_interval = "10s"
//!
//! [operations]
//! approval_poll_interval = "5s"
//! approval_timeout = "24h"
//! step_timeout = "10m"
//! max_attempts = 5
//! initial_backoff = "1s"
//! auto_approve = false
//!
//! [driver]
//! ready_polls = 2
//! ready_poll_interval = "1s"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub daemon: DaemonConfig,
    pub rollout: RolloutConfig,
    pub operations: OperationsConfig,
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding `fleet.redb`.
    pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// How often the rollout controller lists deployment plans.
    #[serde(with = "serde_str")]
    pub poll_interval: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// Interval between approval checks while an operation waits.
    #[serde(with = "serde_str")]
    pub approval_poll_interval: Duration,
    /// Upper bound on the approval wait.
    #[serde(with = "serde_str")]
    pub approval_timeout: Duration,
    /// Upper bound on every other orchestration step attempt.
    #[serde(with = "serde_str")]
    pub step_timeout: Duration,
    /// Attempts per step before the step is declared failed.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(with = "serde_str")]
    pub initial_backoff: Duration,
    /// Approve operations as soon as they request approval.
    pub auto_approve: bool,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            approval_poll_interval: Duration::from_secs(5),
            approval_timeout: Duration::from_secs(24 * 3600),
            step_timeout: Duration::from_secs(600),
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            auto_approve: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Readiness polls before a started instance is reported Running.
    pub ready_polls: u32,
    #[serde(with = "serde_str")]
    pub ready_poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            ready_polls: 2,
            ready_poll_interval: Duration::from_secs(1),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would stall or spin the control loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rollout.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "rollout.poll_interval must be greater than zero".into(),
            ));
        }
        if self.operations.approval_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "operations.approval_poll_interval must be greater than zero".into(),
            ));
        }
        if self.operations.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "operations.max_attempts must be at least 1".into(),
            ));
        }
        if self.operations.step_timeout.is_zero() || self.operations.approval_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "operation timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Path of the redb database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.daemon.data_dir.join("fleet.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config, FleetConfig::default());
        assert_eq!(
            config.operations.approval_poll_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn parses_partial_sections() {
        let toml_str = r#"
[daemon]
data_dir = "/tmp/fleet"

[operations]
approval_poll_interval = "250ms"
max_attempts = 2
auto_approve = true
"#;
        let config = FleetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.daemon.data_dir, PathBuf::from("/tmp/fleet"));
        assert_eq!(
            config.operations.approval_poll_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.operations.max_attempts, 2);
        assert!(config.operations.auto_approve);
        // Untouched keys keep their defaults.
        assert_eq!(config.operations.step_timeout, Duration::from_secs(600));
        assert_eq!(config.rollout.poll_interval, Duration::from_secs(10));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/fleet/fleet.redb"));
    }

    #[test]
    fn rejects_bad_duration() {
        let err = FleetConfig::from_toml_str("[rollout]\npoll_interval = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = FleetConfig::from_toml_str("[operations]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn renders_back_to_toml() {
        let rendered = FleetConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("poll_interval = \"10s\""));
        assert!(rendered.contains("approval_timeout = \"24h\""));
        let reparsed = FleetConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed, FleetConfig::default());
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[driver]\nready_polls = 0\n").unwrap();

        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.driver.ready_polls, 0);

        let missing = FleetConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
