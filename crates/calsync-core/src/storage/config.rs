//! TOML-based sync configuration.
//!
//! Stores the engine's tunables:
//! - Timer interval and pull windows
//! - Retry ceiling and backoff curve
//! - Push concurrency and per-call timeout
//! - Calendars to reconcile
//!
//! Configuration is stored at `~/.config/calsync/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::data_dir;
use crate::error::ConfigError;
use crate::sync::TimeRange;

/// A pull window relative to "now", in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default = "default_days_ahead")]
    pub days_ahead: u32,
}

impl WindowConfig {
    /// Concrete range around `now`, aligned to UTC midnight.
    pub fn range_around(&self, now: DateTime<Utc>) -> TimeRange {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        TimeRange {
            start: midnight - chrono::Duration::days(i64::from(self.days_back)),
            end: midnight + chrono::Duration::days(i64::from(self.days_ahead) + 1),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            days_back: default_days_back(),
            days_ahead: default_days_ahead(),
        }
    }
}

/// Sync engine configuration.
///
/// Serialized to/from TOML at `~/.config/calsync/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between timer-driven cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Window for full pulls; `None` means the whole calendar.
    #[serde(default)]
    pub full_sync_window: Option<WindowConfig>,
    /// Window for incremental pulls.
    #[serde(default)]
    pub incremental_window: WindowConfig,
    /// Failed attempts before an action is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_push_concurrency")]
    pub push_concurrency: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Calendars pulled every cycle.
    #[serde(default = "default_calendar_ids")]
    pub calendar_ids: Vec<String>,
}

fn default_days_back() -> u32 {
    2
}
fn default_days_ahead() -> u32 {
    14
}
fn default_interval_secs() -> u64 {
    20
}
fn default_max_retries() -> u32 {
    5
}
fn default_push_concurrency() -> usize {
    4
}
fn default_call_timeout_secs() -> u64 {
    15
}
fn default_retry_base_delay_ms() -> u64 {
    2_000
}
fn default_retry_max_delay_ms() -> u64 {
    300_000
}
fn default_calendar_ids() -> Vec<String> {
    vec!["primary".to_string()]
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            full_sync_window: None,
            incremental_window: WindowConfig::default(),
            max_retries: default_max_retries(),
            push_concurrency: default_push_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            calendar_ids: default_calendar_ids(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_retries".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.push_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "push_concurrency".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.calendar_ids.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "calendar_ids".into(),
                message: "at least one calendar is required".into(),
            });
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "retry_max_delay_ms".into(),
                message: "must not be below retry_base_delay_ms".into(),
            });
        }
        Ok(())
    }

    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() || key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => serde_json::Value::Number(
                        value
                            .parse::<u64>()
                            .map_err(|e| invalid(e.to_string()))?
                            .into(),
                    ),
                    serde_json::Value::String(_) => serde_json::Value::String(value.into()),
                    // Arrays, objects and optional sections take JSON.
                    _ => serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?,
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: SyncConfig =
                    toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a value by dot-separated key without saving.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed
    /// or fails validation.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: SyncConfig =
            serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
