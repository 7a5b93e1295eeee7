//! Logging setup for the chain notifier.
//!
//! A thin shim over `tracing_subscriber` layering: console output, an
//! optional rolling log file, or both. File rotation and retention are
//! delegated to `tracing_appender`'s rolling appender rather than managed
//! here; this crate only decides where the files live and how many to keep.

use std::fs;
use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LoggingError, LoggingResult};

/// Base name for rolling log files; the appender adds the date and `.log`.
const LOG_FILE_PREFIX: &str = "dash-notify";

/// Guard that must be kept alive to ensure log flushing on shutdown.
/// When this guard is dropped, all buffered log entries will be flushed.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Configuration for logging output.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter. If None, falls back to `RUST_LOG` or INFO.
    pub level: Option<LevelFilter>,
    /// Whether to output logs to console (stderr).
    pub console: bool,
    /// Optional file logging configuration.
    pub file: Option<LogFileConfig>,
}

/// Configuration for log file output.
#[derive(Debug, Clone)]
pub struct LogFileConfig {
    /// Directory where log files will be stored.
    pub log_dir: PathBuf,
    /// How many rotated log files to retain. Zero keeps them all.
    pub max_files: usize,
}

/// Initialize console-only logging with the given level.
///
/// This is a convenience function for simple use cases. For file logging,
/// use [`init_logging`] with a [`LoggingConfig`].
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file: None,
    })
}

/// Initialize logging with the given configuration.
///
/// Returns a [`LoggingGuard`] that must be kept alive for the duration of the
/// application; dropping it flushes buffered entries to disk. If neither
/// console nor file output is enabled, logging is disabled and the tracing
/// macros become no-ops.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    // Explicit level wins over RUST_LOG.
    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, guard) = match &config.file {
        Some(file_config) => {
            let (writer, guard) = file_writer(file_config)?;
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer =
        config.console.then(|| fmt::layer().with_target(true).with_thread_ids(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: guard,
    })
}

/// Build the non-blocking writer backed by a daily-rolling file.
///
/// The appender owns rotation and, when `max_files` is non-zero, pruning of
/// old files.
fn file_writer(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir).map_err(LoggingError::Directory)?;

    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log");
    if config.max_files > 0 {
        builder = builder.max_log_files(config.max_files);
    }

    let appender = builder
        .build(&config.log_dir)
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(tracing_appender::non_blocking(appender))
}
