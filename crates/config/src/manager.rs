//! Layered configuration manager
//!
//! Settings are resolved with `config-rs` from built-in defaults, then an
//! optional TOML file, then `DISPATCH_*` environment variables. Nested TOML
//! tables are addressed by dotted keys (`[dispatcher] max_retries` is
//! `dispatcher.max_retries`); environment variables map `__` to `.`
//! (`DISPATCH_DISPATCHER__MAX_RETRIES`). Values set at runtime with
//! [`ConfigManager::set`] win over every layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config_rs::builder::DefaultState;
use config_rs::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

use common::error::{Error, Result};
use common::utils::{parse_bool, parse_duration};

use crate::defaults::DefaultConfig;

/// Prefix of environment variables that override settings
pub const ENV_PREFIX: &str = "DISPATCH";

/// Separator between nested key segments in environment variable names
pub const ENV_SEPARATOR: &str = "__";

/// Typed key/value configuration store
pub struct ConfigManager {
    /// Defaults, file and environment layers
    layers: Config,

    /// Runtime overrides
    overrides: RwLock<HashMap<String, Value>>,

    /// File the settings were loaded from, if any
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a configuration manager from defaults, the user config file
    /// (if present) and the process environment
    pub fn new() -> Result<Self> {
        let user_file = Self::default_config_path().filter(|path| path.exists());
        Self::layered(user_file.as_deref(), None)
    }

    /// Creates a configuration manager holding only the built-in defaults
    pub fn with_defaults() -> Self {
        let layers = Self::defaults_builder()
            .and_then(|builder| builder.build())
            .unwrap_or_else(|e| {
                warn!("Built-in defaults rejected: {}", e);
                Config::default()
            });

        Self {
            layers,
            overrides: RwLock::new(HashMap::new()),
            source: None,
        }
    }

    /// Creates a configuration manager from defaults, `path` and the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::layered(Some(path.as_ref()), None)
    }

    /// Resolves defaults, then `file`, then environment overrides
    ///
    /// `env` replaces the process environment when given.
    pub fn layered(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Self::defaults_builder().map_err(config_error)?;

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator(ENV_SEPARATOR)
            .source(env.map(|vars| vars.into_iter().collect()));
        builder = builder.add_source(environment);

        let layers = builder.build().map_err(|e| match file {
            Some(path) => Error::Config(format!("Failed to load {}: {}", path.display(), e)),
            None => config_error(e),
        })?;

        if let Some(path) = file {
            info!("Loaded settings from {}", path.display());
        }

        Ok(Self {
            layers,
            overrides: RwLock::new(HashMap::new()),
            source: file.map(Path::to_path_buf),
        })
    }

    fn defaults_builder() -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        DefaultConfig::values()
            .into_iter()
            .try_fold(Config::builder(), |builder, (key, value)| {
                builder.set_default(key, default_value(&value))
            })
    }

    /// Location of the per-user configuration file
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mass-dispatch").join("config.toml"))
    }

    /// Sets a single value, overriding every layer
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.overrides.write().insert(key.to_string(), value.into());
    }

    /// Returns true if the key has a value
    pub fn contains(&self, key: &str) -> bool {
        self.get_value(key).is_ok()
    }

    /// File the settings were loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn get_value(&self, key: &str) -> Result<Value> {
        if let Some(value) = self.overrides.read().get(key) {
            return Ok(value.clone());
        }

        self.layers.get::<Value>(key).map_err(|e| match e {
            ConfigError::NotFound(_) => Error::NotFound(format!("Configuration key {}", key)),
            other => config_error(other),
        })
    }

    fn invalid(key: &str, expected: &str, value: &Value) -> Error {
        Error::Config(format!("{} must be {}, got {}", key, expected, value))
    }

    /// Gets a floating point value
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        let value = self.get_value(key)?;
        match &value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| Self::invalid(key, "a number", &value))
    }

    /// Gets a single-precision value
    pub fn get_f32(&self, key: &str) -> Result<f32> {
        self.get_f64(key).map(|v| v as f32)
    }

    /// Gets an unsigned integer value
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        let value = self.get_value(key)?;
        match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| Self::invalid(key, "a non-negative integer", &value))
    }

    /// Gets a `u32` value
    pub fn get_u32(&self, key: &str) -> Result<u32> {
        let raw = self.get_u64(key)?;
        u32::try_from(raw).map_err(|_| Error::Config(format!("{} is out of range: {}", key, raw)))
    }

    /// Gets a `usize` value
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        let raw = self.get_u64(key)?;
        usize::try_from(raw).map_err(|_| Error::Config(format!("{} is out of range: {}", key, raw)))
    }

    /// Gets a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let value = self.get_value(key)?;
        match &value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => Ok(parse_bool(s)),
            _ => Err(Self::invalid(key, "a boolean", &value)),
        }
    }

    /// Gets a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        let value = self.get_value(key)?;
        match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(Self::invalid(key, "a string", &other)),
        }
    }

    /// Gets a duration; numbers are seconds, strings accept `ms`, `s` and `m` suffixes
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        let value = self.get_value(key)?;
        let parsed = match &value {
            Value::Number(n) => n
                .as_f64()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64),
            Value::String(s) => parse_duration(s),
            _ => None,
        };

        parsed.ok_or_else(|| Self::invalid(key, "a duration", &value))
    }

    /// Gets a filesystem path
    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        self.get_string(key).map(PathBuf::from)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn config_error(e: ConfigError) -> Error {
    Error::Config(e.to_string())
}

fn default_value(value: &Value) -> config_rs::Value {
    match value {
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or_default().into(),
        },
        Value::String(s) => s.clone().into(),
        other => other.to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_typed() {
        let config = ConfigManager::with_defaults();

        assert_eq!(config.get_u32("dispatcher.max_retries").unwrap(), 3);
        assert_eq!(config.get_duration("dispatcher.retry_delay").unwrap(), Duration::from_secs(2));
        assert_eq!(config.get_f32("scaling.cpu_threshold_percent").unwrap(), 80.0);
        assert!(config.get_bool("scaling.enabled").unwrap());
    }

    #[test]
    fn test_file_then_env_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher]\nmax_retries = 5\nretry_delay = \"500ms\"\n[scaling]\nbase_workers = 8").unwrap();

        let env = HashMap::from([
            ("DISPATCH_SCALING__BASE_WORKERS".to_string(), "2".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        let config = ConfigManager::layered(Some(file.path()), Some(env)).unwrap();

        assert_eq!(config.get_u32("dispatcher.max_retries").unwrap(), 5);
        assert_eq!(config.get_duration("dispatcher.retry_delay").unwrap(), Duration::from_millis(500));
        assert_eq!(config.get_usize("scaling.base_workers").unwrap(), 2);
        assert_eq!(config.get_u32("dispatcher.max_poll_attempts").unwrap(), 30);
        assert!(!config.contains("unrelated"));
        assert_eq!(config.source(), Some(file.path()));
    }

    #[test]
    fn test_runtime_overrides_win() {
        let env = HashMap::from([("DISPATCH_LOGGING__LEVEL".to_string(), "debug".to_string())]);
        let config = ConfigManager::layered(None, Some(env)).unwrap();
        assert_eq!(config.get_string("logging.level").unwrap(), "debug");

        config.set("logging.level", "trace");
        assert_eq!(config.get_string("logging.level").unwrap(), "trace");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher\nmax_retries = ").unwrap();

        let result = ConfigManager::layered(Some(file.path()), Some(HashMap::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_type_errors_and_missing_keys() {
        let config = ConfigManager::with_defaults();
        config.set("pool.label", "fast");

        assert!(matches!(config.get_u64("pool.label"), Err(Error::Config(_))));
        assert!(config.get_string("no.such.key").unwrap_err().is_not_found());
    }
}
