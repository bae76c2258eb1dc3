/// Session-level records: the immutable download session, per-attempt
/// records, and the end-of-run summary.
use crate::config::AcceleratorConfig;
use crate::pause::PauseRecord;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One invocation's download of a single artifact.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub artifact: String,
    pub speed_threshold_mbps: f64,
    pub check_interval: Duration,
    pub max_retries: u32,
    pub started_at: DateTime<Local>,
    started: Instant,
}

impl DownloadSession {
    pub fn new(artifact: &str, config: &AcceleratorConfig) -> Self {
        Self {
            artifact: artifact.to_string(),
            speed_threshold_mbps: config.monitor.speed_threshold_mbps,
            check_interval: config.monitor.check_interval(),
            max_retries: config.monitor.max_retries,
            started_at: Local::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Artifact name made safe for use in file names (`llama3:8b` -> `llama3_8b`).
    pub fn file_stem(&self) -> String {
        sanitize(&self.artifact)
    }

    /// `{stem}_{YYYYmmdd_HHMMSS}`, the log file name without extension.
    pub fn log_file_prefix(&self) -> String {
        format!(
            "{}_{}",
            self.file_stem(),
            self.started_at.format("%Y%m%d_%H%M%S")
        )
    }

    pub fn status_file(&self, log_dir: &Path) -> PathBuf {
        status_file_path(log_dir, &self.artifact)
    }
}

/// Status file location for an artifact: `{log_dir}/{stem}.status`.
pub fn status_file_path(log_dir: &Path, artifact: &str) -> PathBuf {
    log_dir.join(format!("{}.status", sanitize(artifact)))
}

fn sanitize(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "artifact".to_string()
    } else {
        stem
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEnd {
    /// The child exited on its own.
    Exited(String),
    /// We stopped it to restart.
    Restarted,
    /// The command could not be spawned.
    SpawnFailed(String),
    /// Stopped because the session ended (failure or interrupt).
    Stopped,
}

/// One child-process invocation.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based attempt index.
    pub index: u32,
    pub started_at: DateTime<Local>,
    pub ended_at: Option<DateTime<Local>>,
    pub end: Option<AttemptEnd>,
    /// Last completion percentage seen during the attempt.
    pub last_percent: Option<f64>,
}

impl AttemptRecord {
    pub fn start(index: u32) -> Self {
        Self {
            index,
            started_at: Local::now(),
            ended_at: None,
            end: None,
            last_percent: None,
        }
    }

    pub fn close(&mut self, end: AttemptEnd) {
        if self.is_running() {
            self.ended_at = Some(Local::now());
            self.end = Some(end);
        }
    }

    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// End-of-run figures printed and logged after the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub elapsed: Duration,
    pub attempts: u32,
    pub retries: u32,
    pub pauses: PauseRecord,
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Total time:   {:.2} s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Attempts:     {}", self.attempts)?;
        writeln!(f, "Retries:      {}", self.retries)?;
        write!(
            f,
            "Pauses:       {} ({:.0} s paused)",
            self.pauses.count,
            self.pauses.total_paused.as_secs_f64()
        )
    }
}
