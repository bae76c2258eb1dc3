/// Status file: writes `{artifact}.status` as JSON on every state transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Download states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Starting,
    Downloading,
    Restarting,
    Completed,
    Failed,
    Interrupted,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Interrupted
        )
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusData {
    pub pid: u32,
    pub artifact: String,
    pub state: DownloadState,
    pub attempt: u32,
    pub retries: u32,
    pub max_retries: u32,
    pub paused: bool,
    pub pauses: u32,
    pub last_percent: Option<f64>,
    pub last_speed_mbps: Option<f64>,
    pub session_start: DateTime<Local>,
    pub last_update: DateTime<Local>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Replace the status file atomically.
    ///
    /// The JSON goes to a hidden sibling first and is renamed over the real
    /// file, so `--status` never reads a half-written document.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json = serde_json::to_vec_pretty(data).map_err(|source| StatusError::Serialize { source })?;
        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, &json).map_err(|source| StatusError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source,
        })
    }

    /// `.{file name}.tmp.{pid}` next to the status file.
    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("status");
        self.path
            .with_file_name(format!(".{name}.tmp.{}", std::process::id()))
    }

    /// Read back a status file written by a (possibly other) run.
    pub fn read(&self) -> Result<StatusData, StatusError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| StatusError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        serde_json::from_str(&contents).map_err(|e| StatusError::Serialize { source: e })
    }

    /// Remove the status file (on successful completion).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// Path to the status file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to (de)serialize status: {source}"),
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
