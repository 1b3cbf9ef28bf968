//! Logging setup for Mass Dispatch
//!
//! This crate installs the global `tracing` subscriber. Output goes to stderr
//! (or a file) in human, compact or JSON format; `RUST_LOG` overrides the
//! configured level.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use common::error::{Error, Result};
use config::ConfigManager;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Multi-field human-readable lines
    #[default]
    Human,
    /// Single terse line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "text" => Ok(LogFormat::Human),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logging options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `inference_engine=debug`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Write to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            file: None,
        }
    }
}

impl LogConfig {
    /// Reads `logging.level`, `logging.format` and `logging.file`
    pub fn from_config(config_manager: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();

        let level = config_manager
            .get_string("logging.level")
            .unwrap_or(defaults.level);

        let format = match config_manager.get_string("logging.format") {
            Ok(raw) => raw.parse().map_err(Error::Config)?,
            Err(_) => defaults.format,
        };

        let file = config_manager.get_path("logging.file").ok();

        Ok(Self { level, format, file })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Installs the global subscriber
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the program when logging to a file.
pub fn init_logging(log_config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let (writer, guard) = match &log_config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| Error::Config(format!("Log file path has no file name: {}", path.display())))?;

            std::fs::create_dir_all(&dir)?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_config.filter())
        .with_target(true)
        .with_writer(writer);

    let installed = match log_config.format {
        LogFormat::Human => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install log subscriber: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Human));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Compact.to_string(), "compact");
    }

    #[test]
    fn test_config_from_manager() {
        let config_manager = ConfigManager::with_defaults();
        config_manager.set("logging.format", "json");
        config_manager.set("logging.file", "/tmp/dispatch.log");

        let log_config = LogConfig::from_config(&config_manager).unwrap();
        assert_eq!(log_config.level, "info");
        assert_eq!(log_config.format, LogFormat::Json);
        assert_eq!(log_config.file, Some(PathBuf::from("/tmp/dispatch.log")));
    }

    #[test]
    fn test_bad_format_is_rejected() {
        let config_manager = ConfigManager::with_defaults();
        config_manager.set("logging.format", "xml");

        assert!(LogConfig::from_config(&config_manager).is_err());
    }
}
