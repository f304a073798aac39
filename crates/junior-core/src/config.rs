//! Configuration for the junior daemon.
//!
//! Read from `.junior/config.yaml`. Every key is optional; a missing file
//! yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// What a front-end should do with the daemon when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExit {
    #[default]
    Ask,
    Stop,
    Keep,
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on concurrently executing jobs.
    pub max_concurrency: usize,
    pub on_exit: OnExit,

    // Agent
    pub agent_command: String,
    pub finalize_model: String,

    // Loop cadence
    pub poll_interval_ms: u64,
    pub hook_poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub shutdown_timeout_ms: u64,

    // Process supervision
    pub activity_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub cancel_check_interval_ms: u64,
    pub kill_escalation_ms: u64,
    pub usage_flush_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            on_exit: OnExit::Ask,
            agent_command: "claude".to_string(),
            finalize_model: "sonnet".to_string(),
            poll_interval_ms: 2_000,
            hook_poll_interval_ms: 60_000,
            heartbeat_interval_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            activity_timeout_ms: 10 * 60 * 1_000,
            watchdog_interval_ms: 30_000,
            cancel_check_interval_ms: 2_000,
            kill_escalation_ms: 5_000,
            usage_flush_interval_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse YAML content and validate it.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as unit, not as an empty map.
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back to disk.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(ConfigError::Invalid {
                key: "max_concurrency",
                reason: format!(
                    "must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, got {}",
                    self.max_concurrency
                ),
            });
        }
        if self.agent_command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "agent_command",
                reason: "must not be empty".to_string(),
            });
        }
        if self.finalize_model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "finalize_model",
                reason: "must not be empty".to_string(),
            });
        }
        let intervals = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("hook_poll_interval_ms", self.hook_poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("activity_timeout_ms", self.activity_timeout_ms),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("cancel_check_interval_ms", self.cancel_check_interval_ms),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hook_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hook_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.on_exit, OnExit::Ask);
        assert_eq!(config.agent_command, "claude");
        assert_eq!(config.finalize_model, "sonnet");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_yaml_keeps_defaults() {
        let config = Config::parse("max_concurrency: 4\non_exit: keep\n").unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.on_exit, OnExit::Keep);
        assert_eq!(config.poll_interval_ms, 2_000);
    }

    #[test]
    fn parse_empty_document() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        for value in ["0", "17"] {
            let err = Config::parse(&format!("max_concurrency: {value}")).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid {
                    key: "max_concurrency",
                    ..
                }
            ));
        }
    }

    #[test]
    fn rejects_unknown_on_exit() {
        assert!(matches!(
            Config::parse("on_exit: later").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn rejects_zero_interval() {
        let err = Config::parse("cancel_check_interval_ms: 0").unwrap_err();
        assert!(err.to_string().contains("cancel_check_interval_ms"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".junior/config.yaml");
        let config = Config {
            max_concurrency: 3,
            on_exit: OnExit::Stop,
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
