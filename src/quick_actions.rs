//! Per-provider quick-action sets and the deployment override policy.
//!
//! Deployments describe overrides loosely (`true`, `false`, `null`, or a
//! table). That input is translated into [`QuickActionSetting`] at the
//! boundary; the merge itself only sees the tagged form.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::GenError;

/// An entry of a resolved quick-action map.
#[derive(Debug)]
pub enum QuickAction<T> {
    /// Enabled with whatever the provider does by default.
    Enabled,
    Configured(Arc<T>),
}

impl<T> Clone for QuickAction<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Enabled => Self::Enabled,
            Self::Configured(config) => Self::Configured(Arc::clone(config)),
        }
    }
}

impl<T> QuickAction<T> {
    pub fn configured(config: T) -> Self {
        Self::Configured(Arc::new(config))
    }

    pub fn config(&self) -> Option<&Arc<T>> {
        match self {
            Self::Enabled => None,
            Self::Configured(config) => Some(config),
        }
    }
}

/// A deployment's instruction for one quick action.
#[derive(Debug)]
pub enum QuickActionSetting<T> {
    /// Use the provider default, or enable the action if there is none.
    Keep,
    /// Disable the action.
    Remove,
    /// Replace the default wholesale.
    Override(Arc<T>),
}

impl<T> Clone for QuickActionSetting<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Keep => Self::Keep,
            Self::Remove => Self::Remove,
            Self::Override(config) => Self::Override(Arc::clone(config)),
        }
    }
}

pub type QuickActionMap<T> = BTreeMap<String, QuickAction<T>>;
pub type QuickActionSettings<T> = BTreeMap<String, QuickActionSetting<T>>;

/// Configuration carried by a quick action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuickActionConfig {
    pub label: Option<String>,
    pub prompt: Option<String>,
}

impl<T: DeserializeOwned> QuickActionSetting<T> {
    pub fn from_json(value: serde_json::Value) -> Result<Self, GenError> {
        match value {
            serde_json::Value::Bool(true) => Ok(Self::Keep),
            serde_json::Value::Bool(false) | serde_json::Value::Null => Ok(Self::Remove),
            other => serde_json::from_value(other)
                .map(|config| Self::Override(Arc::new(config)))
                .map_err(|e| GenError::Config(format!("invalid quick action override: {e}"))),
        }
    }

    /// TOML has no null, so only `false` disables.
    pub fn from_toml(value: toml::Value) -> Result<Self, GenError> {
        match value {
            toml::Value::Boolean(true) => Ok(Self::Keep),
            toml::Value::Boolean(false) => Ok(Self::Remove),
            other => other
                .try_into()
                .map(|config| Self::Override(Arc::new(config)))
                .map_err(|e| GenError::Config(format!("invalid quick action override: {e}"))),
        }
    }
}

/// Translate a loosely typed JSON object into settings.
pub fn settings_from_json<T: DeserializeOwned>(
    value: serde_json::Value,
) -> Result<QuickActionSettings<T>, GenError> {
    let serde_json::Value::Object(entries) = value else {
        return Err(GenError::Config(
            "quick action settings must be an object".to_string(),
        ));
    };
    entries
        .into_iter()
        .map(|(id, value)| Ok((id, QuickActionSetting::from_json(value)?)))
        .collect()
}

/// Apply deployment `settings` on top of provider `defaults`.
///
/// Neither input is modified. Entries kept from `defaults` and overrides taken
/// from `settings` share their `Arc` with the input, so callers may rely on
/// pointer identity.
pub fn merge_quick_actions<T>(
    defaults: &QuickActionMap<T>,
    settings: &QuickActionSettings<T>,
) -> QuickActionMap<T> {
    let mut merged = defaults.clone();
    for (id, setting) in settings {
        match setting {
            QuickActionSetting::Remove => {
                merged.remove(id);
            }
            QuickActionSetting::Keep => {
                merged.entry(id.clone()).or_insert(QuickAction::Enabled);
            }
            QuickActionSetting::Override(config) => {
                merged.insert(id.clone(), QuickAction::Configured(Arc::clone(config)));
            }
        }
    }
    merged
}
