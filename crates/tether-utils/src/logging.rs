//! # Logging Utilities
//!
//! Subscriber setup for the `tracing` events the core emits.
//!
//! - Pretty output for development, JSON for machines
//! - Console (stderr) and/or a daily-rolling log file
//! - `RUST_LOG` filters, overridable by an explicit level
//!
//! Console output goes to stderr so that stdout stays free for command
//! output (e.g. `tether replay --json`).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether_utils::init_logging;
//!
//! // Keep the guard alive for as long as logs should be flushed to file.
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=tether_core=trace`)
//! - `TETHER_LOG_FORMAT`: `json` or `pretty` (default `pretty`)
//! - `TETHER_LOG_FILE`: also write logs to this file (rolled daily)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!("{s} (use 'pretty' or 'json')"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s} (use 'error', 'warn', 'info', 'debug', or 'trace')"
            ))),
        }
    }
}

/// Where and how to log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings
{
    /// Explicit level; `None` defers to `RUST_LOG`, then `info`
    pub level: Option<LogLevel>,
    /// Output format for every sink
    pub format: LogFormat,
    /// Log file, if any
    pub file: Option<PathBuf>,
    /// Whether to log to stderr
    pub console: bool,
}

impl Default for LogSettings
{
    fn default() -> Self
    {
        Self {
            level: None,
            format: LogFormat::Pretty,
            file: None,
            console: true,
        }
    }
}

impl LogSettings
{
    /// Settings from `TETHER_LOG_FORMAT` and `TETHER_LOG_FILE`
    ///
    /// An unparseable format falls back to pretty.
    pub fn from_env() -> Self
    {
        Self {
            format: env::var("TETHER_LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            file: env::var("TETHER_LOG_FILE").ok().map(PathBuf::from),
            ..Self::default()
        }
    }
}

/// Keeps the background file writer alive
///
/// Dropping it flushes and stops file logging; hold it for the life of the
/// program.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// ## Errors
///
/// Returns an error if logging is already initialized.
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    init_logging_with(&LogSettings::from_env())
}

/// Initialize console logging with an explicit level and format
///
/// `TETHER_LOG_FILE` is still honoured.
///
/// ## Example
///
/// ```rust,no_run
/// use tether_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let settings = LogSettings {
        level: Some(level),
        format,
        ..LogSettings::from_env()
    };
    init_logging_with(&settings)
}

/// Default log file: `~/.tether/YYYY-MM-DD-tether.log`, or under `/tmp`
/// when there is no home directory
///
/// ## Errors
///
/// Returns an error if `~/.tether` cannot be created.
pub fn default_log_file() -> Result<PathBuf, LoggingError>
{
    let name = format!("{}-tether.log", Utc::now().format("%Y-%m-%d"));
    match env::var("HOME") {
        Ok(home) => {
            let dir = PathBuf::from(home).join(".tether");
            std::fs::create_dir_all(&dir)?;
            Ok(dir.join(name))
        }
        Err(_) => Ok(PathBuf::from("/tmp").join(name)),
    }
}

fn build_filter(level: Option<LogLevel>) -> EnvFilter
{
    match level {
        Some(level) => EnvFilter::new(Level::from(level).to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn layer_for<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn split_log_path(path: &Path) -> (PathBuf, PathBuf)
{
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let name = path
        .file_name()
        .map_or_else(|| PathBuf::from("tether.log"), PathBuf::from);
    (dir, name)
}

/// Initialize logging from explicit settings
///
/// ## Errors
///
/// Returns an error if logging is already initialized or neither sink is enabled.
pub fn init_logging_with(settings: &LogSettings) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if settings.console {
        layers.push(layer_for(settings.format, io::stderr, true, build_filter(settings.level)));
    }
    if let Some(path) = &settings.file {
        let (dir, name) = split_log_path(path);
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);
        layers.push(layer_for(settings.format, writer, false, build_filter(settings.level)));
    }
    if layers.is_empty() {
        return Err(LoggingError::InitializationFailed("no log sink enabled".into()));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    Ok(LoggingGuard { _file: guard })
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
