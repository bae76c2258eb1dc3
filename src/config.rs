use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from accelerator.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub download: DownloadConfig,
    pub monitor: MonitorConfig,
    pub resources: ResourcesConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Restart when throughput stays below this many MB/s.
    pub speed_threshold_mbps: f64,
    pub check_interval_secs: u64,
    pub max_retries: u32,
    /// Seconds between SIGTERM and SIGKILL when stopping the child.
    pub terminate_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Enables the advanced variant: pause the download under host pressure.
    pub enabled: bool,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub pause_duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
}

// --- Default implementations ---

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            command: "ollama".to_string(),
            args: vec!["pull".to_string(), "{artifact}".to_string()],
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            speed_threshold_mbps: 10.0,
            check_interval_secs: 3,
            max_retries: 50,
            terminate_grace_secs: 5,
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
            pause_duration_secs: 60,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("log"),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

impl ResourcesConfig {
    pub fn pause_duration(&self) -> Duration {
        Duration::from_secs(self.pause_duration_secs)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<AcceleratorConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(AcceleratorConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl AcceleratorConfig {
    /// Reject settings the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download.command.trim().is_empty() {
            return Err(ConfigError::Invalid("download.command is empty".into()));
        }
        if !(self.monitor.speed_threshold_mbps > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "speed threshold must be positive, got {}",
                self.monitor.speed_threshold_mbps
            )));
        }
        if self.monitor.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "check interval must be at least 1 second".into(),
            ));
        }
        for (name, value) in [
            ("cpu threshold", self.resources.cpu_threshold),
            ("memory threshold", self.resources.memory_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and 100, got {value}"
                )));
            }
        }
        Ok(())
    }
}
