//! Tracing subscriber setup for binaries.
//!
//! Console output goes to stderr, pretty or JSON. An optional log file
//! always receives JSON through a non-blocking writer; keep the returned
//! [`LogGuards`] alive until exit or buffered lines are lost.

use crate::config::EnvParser;
use crate::errors::{ConfigError, LoggingError};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const DEFAULT_LOG_FILTER: &str = "info";

const DEFAULT_LOG_FILE_NAME: &str = "fleetrun.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info,fleetrun_common=debug`.
    pub filter: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Read `FLEETRUN_LOG`, `FLEETRUN_LOG_FORMAT` and `FLEETRUN_LOG_FILE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut env = EnvParser::with_prefix("FLEETRUN_");
        let filter = env.get_string("LOG", DEFAULT_LOG_FILTER);
        let format = match env.get_choice("LOG_FORMAT", "pretty", &["pretty", "json"]).as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let file = env.get_optional_string("LOG_FILE").map(PathBuf::from);

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        Ok(Self {
            filter,
            format,
            file,
        })
    }

    /// Force `debug` regardless of the configured filter.
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.filter = "debug".to_string();
        }
        self
    }
}

/// Flush guards for non-blocking writers.
#[derive(Debug)]
#[must_use = "dropping the guards stops the file writer"]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LogGuards, LoggingError> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|source| LoggingError::Filter {
        filter: config.filter.clone(),
        source,
    })?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = Vec::new();

    layers.push(match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
    });

    if let Some(path) = &config.file {
        let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
        guards.push(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    Ok(LogGuards { _guards: guards })
}

/// Plain append-only file at `path`; its directory is created if needed.
fn file_appender(path: &Path) -> Result<RollingFileAppender, LoggingError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE_NAME);

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .map_err(|source| LoggingError::File {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    const VARS: [&str; 3] = ["FLEETRUN_LOG", "FLEETRUN_LOG_FORMAT", "FLEETRUN_LOG_FILE"];

    fn clear() {
        for var in VARS {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_from_env_defaults() {
        let _guard = env_test_lock();
        clear();
        assert_eq!(LogConfig::from_env().unwrap(), LogConfig::default());
    }

    #[test]
    fn test_from_env_overrides() {
        let _guard = env_test_lock();
        clear();
        // SAFETY: Tests are serialized via env_test_lock
        unsafe {
            std::env::set_var("FLEETRUN_LOG", "warn,fleetrun_common=debug");
            std::env::set_var("FLEETRUN_LOG_FORMAT", "json");
            std::env::set_var("FLEETRUN_LOG_FILE", "/tmp/fleetrun/run.log");
        }

        let config = LogConfig::from_env().unwrap();
        assert_eq!(config.filter, "warn,fleetrun_common=debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/fleetrun/run.log")));
        assert_eq!(config.verbose(true).filter, "debug");
        clear();
    }

    #[test]
    fn test_from_env_rejects_unknown_format() {
        let _guard = env_test_lock();
        clear();
        // SAFETY: Tests are serialized via env_test_lock
        unsafe { std::env::set_var("FLEETRUN_LOG_FORMAT", "xml") };

        let err = LogConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("FLEETRUN_LOG_FORMAT"));
        clear();
    }

    #[test]
    fn test_invalid_filter_fails_before_install() {
        let config = LogConfig {
            filter: "fleetrun=loud".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::Filter { .. })
        ));
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.log");
        assert!(file_appender(&path).is_ok());
        assert!(dir.path().join("nested").is_dir());
    }
}
