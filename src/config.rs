/*!
 * Configuration types for ferry
 *
 * Settings are read from a TOML file: `--config <path>` when given,
 * otherwise `<config dir>/ferry/config.toml` when it exists, otherwise
 * defaults. Command-line flags override individual fields afterwards.
 */

use crate::error::{FerryError, Result};
use ferry_core_resilience::retry_timer::{BackoffConfig, DEFAULT_CAP, DEFAULT_JITTER, DEFAULT_UNIT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Parallel transfers (0 = number of CPUs, clamped to 4..=128)
    #[serde(default)]
    pub concurrency: usize,

    /// Directory holding session files (None = `~/.ferry/sessions`)
    #[serde(default)]
    pub session_dir: Option<PathBuf>,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Print results as JSON lines
    #[serde(default)]
    pub json: bool,

    /// Print only errors and the summary
    #[serde(default)]
    pub quiet: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Stat the targets of resumed tasks and transfer missing ones again
    #[serde(default)]
    pub verify_resumed: bool,

    /// Alias name to the local directory it serves
    #[serde(default)]
    pub aliases: BTreeMap<String, PathBuf>,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            session_dir: None,
            log_level: LogLevel::Info,
            log_file: None,
            json: false,
            quiet: false,
            retry: RetryConfig::default(),
            verify_resumed: false,
            aliases: BTreeMap::new(),
        }
    }
}

/// Retry policy for transient storage errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base backoff delay in milliseconds
    #[serde(default = "default_unit_ms")]
    pub unit_ms: u64,

    /// Maximum single delay in milliseconds
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,

    /// Fraction of each delay that may be randomly removed (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Attempts per task, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            unit_ms: default_unit_ms(),
            cap_ms: default_cap_ms(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            unit: Duration::from_millis(self.unit_ms),
            cap: Duration::from_millis(self.cap_ms),
            jitter: self.jitter,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(FerryError::Config(format!("unknown log level: {}", other))),
        }
    }
}

// Default value functions for serde
fn default_unit_ms() -> u64 {
    DEFAULT_UNIT.as_millis() as u64
}

fn default_cap_ms() -> u64 {
    DEFAULT_CAP.as_millis() as u64
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER
}

fn default_max_attempts() -> u32 {
    crate::transfer::DEFAULT_MAX_ATTEMPTS
}

impl FerryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FerryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: FerryConfig = toml::from_str(&contents)
            .map_err(|e| FerryError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| FerryError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// `<config dir>/ferry/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ferry").join("config.toml"))
    }

    /// Load `explicit` if given, else the default file if present, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(FerryError::Config(format!(
                "retry.jitter must be between 0 and 1, got {}",
                self.retry.jitter
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(FerryError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.unit_ms > self.retry.cap_ms {
            return Err(FerryError::Config(
                "retry.unit_ms must not exceed retry.cap_ms".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding session files
    pub fn session_dir(&self) -> PathBuf {
        self.session_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ferry")
                .join("sessions")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FerryConfig::default();
        assert_eq!(config.concurrency, 0);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.retry.max_attempts, crate::transfer::DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.retry.backoff(), BackoffConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialization() {
        let mut config = FerryConfig::default();
        config.aliases.insert("backup".into(), PathBuf::from("/srv/backup"));
        let toml = toml::to_string(&config).unwrap();
        let deserialized: FerryConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml_str = r#"
            concurrency = 8
            log_level = "debug"
            verify_resumed = true

            [retry]
            max_attempts = 3

            [aliases]
            local = "/data"
        "#;
        let config: FerryConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(config.verify_resumed);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.unit_ms, default_unit_ms());
        assert_eq!(config.aliases["local"], PathBuf::from("/data"));
    }

    #[test]
    fn test_from_file_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[retry]\njitter = 2.0\n").unwrap();
        assert!(matches!(
            FerryConfig::from_file(&path),
            Err(FerryError::Config(_))
        ));

        let config = FerryConfig {
            session_dir: Some(dir.path().join("sessions")),
            ..Default::default()
        };
        config.to_file(&path).unwrap();
        let loaded = FerryConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.session_dir(), dir.path().join("sessions"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FerryConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
