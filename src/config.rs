use crate::error::ConfigError;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "./weather-fusion.json";

/// Flat key-value configuration for one source. Unrecognized keys are
/// ignored by the consumers; missing optional keys disable the feature they
/// control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceConfig(BTreeMap<String, JsonValue>);

impl SourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    pub fn string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(JsonValue::String(value)) => {
                let trimmed = value.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Some(JsonValue::Number(value)) => Ok(Some(value.to_string())),
            Some(other) => Err(invalid(key, format!("expected a string, got {other}"))),
        }
    }

    pub fn required_string(&self, key: &str) -> Result<String, ConfigError> {
        self.string(key)?
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn f64(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(JsonValue::Number(value)) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| invalid(key, "not representable as f64")),
            Some(JsonValue::String(value)) => value
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|err| invalid(key, err.to_string())),
            Some(other) => Err(invalid(key, format!("expected a number, got {other}"))),
        }
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(JsonValue::Number(value)) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(key, "expected a non-negative integer")),
            Some(JsonValue::String(value)) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|err| invalid(key, err.to_string())),
            Some(other) => Err(invalid(key, format!("expected an integer, got {other}"))),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(JsonValue::Bool(value)) => Ok(Some(*value)),
            Some(JsonValue::String(value)) => {
                let value = value.trim();
                if value == "1" || value.eq_ignore_ascii_case("true") {
                    Ok(Some(true))
                } else if value == "0" || value.eq_ignore_ascii_case("false") {
                    Ok(Some(false))
                } else {
                    Err(invalid(key, format!("expected a bool, got {value:?}")))
                }
            }
            Some(other) => Err(invalid(key, format!("expected a bool, got {other}"))),
        }
    }

    /// Duration in (possibly fractional) seconds. Must be non-negative.
    pub fn seconds(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        match self.f64(key)? {
            None => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|err| invalid(key, format!("{secs} is not a valid duration: {err}"))),
        }
    }

    /// A set of strings, given either as a JSON array or a comma separated
    /// string.
    pub fn string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, ConfigError> {
        let values: Vec<String> = match self.get(key) {
            None => return Ok(None),
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| match item {
                    JsonValue::String(value) => Ok(value.trim().to_string()),
                    JsonValue::Number(value) => Ok(value.to_string()),
                    other => Err(invalid(key, format!("unexpected list entry {other}"))),
                })
                .collect::<Result<_, _>>()?,
            Some(JsonValue::String(value)) => {
                value.split(',').map(|part| part.trim().to_string()).collect()
            }
            Some(other) => return Err(invalid(key, format!("expected a list, got {other}"))),
        };
        Ok(Some(values.into_iter().filter(|v| !v.is_empty()).collect()))
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidKey {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Per-source sections of the config file. An absent section disables that
/// source; `aggregate` falls back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub aggregate: SourceConfig,
    #[serde(default)]
    pub tempest_udp: Option<SourceConfig>,
    #[serde(default)]
    pub tempest_ble: Option<SourceConfig>,
    #[serde(default)]
    pub openweathermap: Option<SourceConfig>,
    #[serde(default)]
    pub tempest_cloud: Option<SourceConfig>,
}

impl SourcesConfig {
    pub fn enabled_sources(&self) -> Vec<&'static str> {
        let mut enabled = Vec::new();
        if self.tempest_udp.is_some() {
            enabled.push("tempest_udp");
        }
        if self.tempest_ble.is_some() {
            enabled.push("tempest_ble");
        }
        if self.openweathermap.is_some() {
            enabled.push("openweathermap");
        }
        if self.tempest_cloud.is_some() {
            enabled.push("tempest_cloud");
        }
        enabled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub config_path: PathBuf,
    pub sources: SourcesConfig,
}

fn config_path(override_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path;
    }
    if let Ok(path) = std::env::var("WEATHER_FUSION_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

impl Config {
    pub fn from_env(override_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::load(&config_path(override_path))
    }

    /// Reads the JSON config file at `path`. A missing file yields a config
    /// with every source disabled.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path_display = path.display().to_string();
        if !path.exists() {
            tracing::warn!(path = %path_display, "config file not found; every source is disabled");
            return Ok(Self {
                config_path: path.to_path_buf(),
                sources: SourcesConfig::default(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;
        let sources: SourcesConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path_display,
                source,
            })?;
        Ok(Self {
            config_path: path.to_path_buf(),
            sources,
        })
    }
}
