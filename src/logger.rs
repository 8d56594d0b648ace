//! Logging infrastructure for netprobe-rs.
//!
//! Logging flows through two paths that stay consistent with each other:
//!
//! - **Process-wide**: [`init`] installs a tracing subscriber writing to
//!   stdout or a file, with `RUST_LOG` able to override the configured
//!   level. The CLI calls this once at startup.
//! - **Per-session**: [`SessionLogger`] mirrors every line into the owning
//!   session's event queue as an [`Event::Log`](crate::session::Event) so
//!   embedding applications can render engine logs without touching the
//!   process-wide subscriber. Log events use the lossy delivery policy: a
//!   slow consumer drops log lines, never measurement results.
//!
//! # Log Levels
//!
//! | Level | Use |
//! |-------|-----|
//! | [`LogLevel::Debug`] | Verbose sessions only |
//! | [`LogLevel::Info`] | Progress of bootstrap and handlers |
//! | [`LogLevel::Warn`] | Recoverable failures, dropped events |
//! | [`LogLevel::Error`] | Failures surfaced to the caller |
//!
//! # Example
//!
//! ```rust,no_run
//! use netprobe_rs::logger::{self, LogLevel};
//!
//! // Initialize logging to stdout at INFO level
//! let _guard = logger::init(LogLevel::Info, None).unwrap();
//! ```

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::session::Event;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Severity of a log line.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging, suppressed unless the session is verbose.
    Debug,
    /// Informational messages.
    #[default]
    Info,
    /// Warning conditions.
    Warn,
    /// Error conditions.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// One log line emitted by a session.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Severity of this line.
    pub level: LogLevel,
    /// The message itself.
    pub message: String,
}

/// Initialize the process-wide logging subscriber.
///
/// Should be called once at application startup; subsequent calls are
/// no-ops. When `logfile` is given, output goes to that file without ANSI
/// colors; otherwise to stdout with colors. `RUST_LOG` overrides `level`
/// when set.
///
/// Returns a guard that must be kept alive for file logging to flush.
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be created.
pub fn init(
    level: LogLevel,
    logfile: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let mut guard = None;
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(None);
    }

    let directive = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive));

    match logfile {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "log file path has no file name",
                    ))
                })?
                .to_owned();
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    let _ = LOGGER_INITIALIZED.set(());
    Ok(guard)
}

/// A logger owned by one session.
///
/// Lines go to the process-wide tracing subscriber and, best-effort, into
/// the session's event queue. Cloning is cheap; the bootstrap procedure
/// and every handler share one instance.
#[derive(Clone)]
pub struct SessionLogger {
    tx: mpsc::Sender<Event>,
    verbose: bool,
}

impl SessionLogger {
    /// Creates a logger emitting into `tx`.
    ///
    /// Debug lines are forwarded only when `verbose` is true.
    pub(crate) fn new(tx: mpsc::Sender<Event>, verbose: bool) -> Self {
        Self { tx, verbose }
    }

    fn emit(&self, level: LogLevel, message: &str) {
        let record = LogRecord {
            level,
            message: message.to_string(),
        };
        // Lossy by design: a slow consumer must not stall the session
        // over a log line.
        if self.tx.try_send(Event::Log(record)).is_err() {
            tracing::warn!("session: dropping log event: slow consumer");
        }
    }

    /// Logs a debug line; suppressed unless the session is verbose.
    pub fn debug(&self, message: &str) {
        if !self.verbose {
            return;
        }
        tracing::debug!("{}", message);
        self.emit(LogLevel::Debug, message);
    }

    /// Logs an info line.
    pub fn info(&self, message: &str) {
        tracing::info!("{}", message);
        self.emit(LogLevel::Info, message);
    }

    /// Logs a warning line.
    pub fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
        self.emit(LogLevel::Warn, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loglevel_display() {
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_loglevel_from_str() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("bogus".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_loglevel_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[tokio::test]
    async fn test_session_logger_emits_log_events() {
        let (tx, mut rx) = mpsc::channel(16);
        let logger = SessionLogger::new(tx, false);
        logger.info("hello");
        match rx.recv().await.unwrap() {
            Event::Log(record) => {
                assert_eq!(record.level, LogLevel::Info);
                assert_eq!(record.message, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_logger_suppresses_debug_when_not_verbose() {
        let (tx, mut rx) = mpsc::channel(16);
        let logger = SessionLogger::new(tx, false);
        logger.debug("hidden");
        logger.info("visible");
        match rx.recv().await.unwrap() {
            Event::Log(record) => assert_eq!(record.message, "visible"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_logger_drops_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let logger = SessionLogger::new(tx, false);
        logger.info("first");
        // queue full: second line is dropped, not blocking
        logger.info("second");
    }
}
