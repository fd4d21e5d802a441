use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOGGING_ENABLED_CRATES: &[&str] = &["supervisor_control"];

/// An enum representing possible errors during logging initialization.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),
    #[error("invalid log level `{0}`")]
    InvalidLevel(String),
    #[error("invalid logging file path: `{0}`")]
    InvalidFilePath(String),
}

/// Logging configuration: level, optional log file. The level applies to
/// this crate only unless `fine_grained_filter` is set, which takes an
/// env-filter directive string and enables logs from any crate.
#[derive(Debug, Deserialize, PartialEq, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub fine_grained_filter: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

pub type FileLoggerGuard = Option<WorkerGuard>;

impl LoggingConfig {
    /// Attempts to initialize the global logging subscriber. Returns the
    /// file appender guard when file logging is enabled; the caller must
    /// hold it for the process lifetime.
    pub fn try_init(&self) -> Result<FileLoggerGuard, LoggingError> {
        let (file_layer, guard) = match &self.file {
            None => (None, None),
            Some(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path
                    .file_name()
                    .ok_or_else(|| LoggingError::InvalidFilePath(path.display().to_string()))?;
                let appender = tracing_appender::rolling::never(dir, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(self.logging_filter()?);
                (Some(layer), Some(guard))
            }
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(true)
            .with_filter(self.logging_filter()?);

        tracing_subscriber::Registry::default()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError("unable to set global logging subscriber".to_string())
            })?;

        debug!("logging initialized successfully");
        Ok(guard)
    }

    fn logging_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Some(directives) = self.fine_grained_filter.as_ref().filter(|s| !s.is_empty()) {
            return EnvFilter::builder()
                .parse(directives)
                .map_err(|err| LoggingError::InvalidLevel(err.to_string()));
        }

        let level: LevelFilter = self.level.into();
        let mut filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::OFF.into())
            .from_env_lossy();
        for crate_name in LOGGING_ENABLED_CRATES {
            let directive = format!("{crate_name}={level}")
                .parse()
                .map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}
