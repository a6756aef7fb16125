use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::angle::DEFAULT_VISIBILITY_FLOOR;
use crate::detector::DEFAULT_DEBOUNCE_MS;
use crate::{RepCounterError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Loads and validates a TOML configuration file. Missing sections and
    /// fields fall back to their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).map_err(|err| RepCounterError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let floor = self.session.visibility_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(RepCounterError::Config(format!(
                "visibility_floor {floor} must lie within [0, 1]"
            )));
        }
        if self.source.max_attempts == 0 {
            return Err(RepCounterError::Config(
                "source.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tuning for angle acceptance, debouncing and joint synchronisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_visibility_floor")]
    pub visibility_floor: f32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Window within which co-primary joints must both complete a rep, unless
    /// the exercise rule pins its own.
    #[serde(default = "default_sync_window_ms")]
    pub sync_window_ms: u64,
}

fn default_visibility_floor() -> f32 {
    DEFAULT_VISIBILITY_FLOOR
}
fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_sync_window_ms() -> u64 {
    500
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            visibility_floor: default_visibility_floor(),
            debounce_ms: default_debounce_ms(),
            sync_window_ms: default_sync_window_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Alternate source indices tried before a session fails to start.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Back-to-back read failures after which a running session ends.
    #[serde(default = "default_max_consecutive_read_failures")]
    pub max_consecutive_read_failures: u32,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_max_consecutive_read_failures() -> u32 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_consecutive_read_failures: default_max_consecutive_read_failures(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
}

fn default_log_enabled() -> bool {
    true
}
fn default_log_path() -> PathBuf {
    PathBuf::from("session_log.jsonl")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            path: default_log_path(),
        }
    }
}
