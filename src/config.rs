use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::GenError;
use crate::lock::{DEFAULT_EDIT_MODE, LockOptions};
use crate::quick_actions::{QuickActionSetting, QuickActionSettings};

/// Config file read when `GENCORE_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "gencore.toml";

/// Default directory for durable rate-limit trackers.
const DEFAULT_STORAGE_DIR: &str = ".gencore/ratelimit";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub time_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            time_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist trackers to disk. When false only the in-memory map is used.
    pub durable: bool,
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            durable: true,
            dir: PathBuf::from(DEFAULT_STORAGE_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub progress_interval_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 100,
        }
    }
}

impl ProcessingConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub edit_mode: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            edit_mode: DEFAULT_EDIT_MODE.to_string(),
        }
    }
}

impl LockConfig {
    pub fn options(&self) -> LockOptions {
        LockOptions {
            edit_mode: self.edit_mode.clone(),
            ..LockOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rate_limit: RateLimitConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub lock: LockConfig,
    /// Provider id -> action id -> `true | false | { label, prompt }`.
    pub quick_actions: HashMap<String, BTreeMap<String, toml::Value>>,
}

impl Config {
    /// Load from `GENCORE_CONFIG` (or `gencore.toml` when present), then
    /// apply environment overrides. Problems are logged and defaults kept.
    pub fn load() -> Self {
        let path = env::var("GENCORE_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            });

        let mut config = match path {
            Some(path) => Self::from_file(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                Self::default()
            }),
            None => Self::default(),
        };
        config.apply_env();
        config
    }

    pub fn from_file(path: &Path) -> Result<Self, GenError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GenError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, GenError> {
        let config: Self =
            toml::from_str(content).map_err(|e| GenError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GenError> {
        if self.rate_limit.time_window_ms == 0 {
            return Err(GenError::Config(
                "rate_limit.time_window_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(max) = env_parse::<usize>("GENCORE_RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = max;
        }
        if let Some(window) = env_parse::<u64>("GENCORE_RATE_LIMIT_WINDOW_MS") {
            if window > 0 {
                self.rate_limit.time_window_ms = window;
            } else {
                tracing::warn!("GENCORE_RATE_LIMIT_WINDOW_MS must be greater than 0, ignored");
            }
        }
        if let Ok(dir) = env::var("GENCORE_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
    }

    /// Quick-action settings configured for `provider_id`.
    pub fn quick_action_settings<T: DeserializeOwned>(
        &self,
        provider_id: &str,
    ) -> Result<QuickActionSettings<T>, GenError> {
        let Some(entries) = self.quick_actions.get(provider_id) else {
            return Ok(QuickActionSettings::new());
        };
        entries
            .iter()
            .map(|(id, value)| {
                QuickActionSetting::from_toml(value.clone())
                    .map(|setting| (id.clone(), setting))
                    .map_err(|e| GenError::Config(format!("quick_actions.{provider_id}.{id}: {e}")))
            })
            .collect()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
