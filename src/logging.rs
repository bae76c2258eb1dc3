/// Tracing setup: a per-session log file that records everything, and a
/// quiet stderr layer so the download tool's progress bar stays readable.
use crate::session::DownloadSession;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Errors from setting up logging.
#[derive(Debug)]
pub enum LoggingError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Appender(tracing_appender::rolling::InitError),
    Init(tracing_subscriber::util::TryInitError),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::CreateDir { path, source } => {
                write!(f, "failed to create log directory {}: {}", path.display(), source)
            }
            LoggingError::Appender(e) => write!(f, "failed to open log file: {e}"),
            LoggingError::Init(e) => write!(f, "failed to install log subscriber: {e}"),
        }
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoggingError::CreateDir { source, .. } => Some(source),
            LoggingError::Appender(e) => Some(e),
            LoggingError::Init(e) => Some(e),
        }
    }
}

/// Local wall-clock timestamps, matching the time in the log file name.
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Console filter: `RUST_LOG` wins, otherwise warn (info with `--verbose`).
fn console_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }))
}

/// Full path of the session log file.
pub fn log_file_path(log_dir: &Path, session: &DownloadSession) -> PathBuf {
    log_dir.join(format!("{}.log", session.log_file_prefix()))
}

/// Install the file + console subscriber for a download session.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// whole run.
pub fn init_session(
    log_dir: &Path,
    session: &DownloadSession,
    verbose: bool,
) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|e| LoggingError::CreateDir {
        path: log_dir.to_path_buf(),
        source: e,
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(session.log_file_prefix())
        .filename_suffix("log")
        .build(log_dir)
        .map_err(LoggingError::Appender)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_timer(LocalTime)
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::DEBUG);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter(verbose));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(LoggingError::Init)?;

    Ok(guard)
}

/// Console-only logging for commands that do not start a session.
pub fn init_console(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(console_filter(verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
