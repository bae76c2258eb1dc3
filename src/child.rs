/// Download child process: spawn the external tool in its own process group,
/// pump its output to the terminal and into a line queue, and signal it.
use crate::config::DownloadConfig;
use crate::progress::LineSplitter;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Upper bound on waiting for buffered output after the child exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors that can occur while launching or controlling the child.
#[derive(Debug)]
pub enum ChildError {
    /// Failed to spawn the download command.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to deliver a signal to the child's process group.
    Signal { signal: Signal, source: nix::Error },
    /// Failed to wait on the child.
    Io { source: std::io::Error },
}

impl std::fmt::Display for ChildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildError::Spawn { command, source } => {
                write!(f, "failed to spawn download command '{}': {}", command, source)
            }
            ChildError::Signal { signal, source } => {
                write!(f, "failed to send {} to download process: {}", signal, source)
            }
            ChildError::Io { source } => write!(f, "I/O error waiting on download process: {}", source),
        }
    }
}

impl std::error::Error for ChildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChildError::Spawn { source, .. } => Some(source),
            ChildError::Signal { source, .. } => Some(source),
            ChildError::Io { source } => Some(source),
        }
    }
}

/// Build the command arguments, replacing `{artifact}` placeholders with the artifact name.
fn build_args(download: &DownloadConfig, artifact: &str) -> Vec<String> {
    download
        .args
        .iter()
        .map(|arg| arg.replace("{artifact}", artifact))
        .collect()
}

/// A running download process.
pub struct DownloadChild {
    child: Child,
    pid: u32,
    started: Instant,
    lines: mpsc::UnboundedReceiver<String>,
}

/// Spawn the download command for `artifact`.
///
/// The child gets its own process group (via `process_group(0)`) so that
/// stop/continue/terminate signals reach any helpers it forks, and a Ctrl-C
/// in the terminal reaches only us. With `echo` set, its output is copied to
/// our stdout/stderr so the tool's native progress display stays visible.
pub fn spawn(download: &DownloadConfig, artifact: &str, echo: bool) -> Result<DownloadChild, ChildError> {
    let args = build_args(download, artifact);
    tracing::info!(command = %download.command, args = ?args, "spawning download process");

    let mut child = Command::new(&download.command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ChildError::Spawn {
            command: download.command.clone(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    let (tx, lines) = mpsc::unbounded_channel();

    if let Some(stdout) = child.stdout.take() {
        let sink = echo.then(tokio::io::stdout);
        tokio::spawn(pump_output(stdout, sink, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        let sink = echo.then(tokio::io::stderr);
        tokio::spawn(pump_output(stderr, sink, tx));
    }

    tracing::info!(pid, "download process started");

    Ok(DownloadChild {
        child,
        pid,
        started: Instant::now(),
        lines,
    })
}

/// Copy child output to `sink` and split it into lines for the control loop.
async fn pump_output<R, W>(mut source: R, mut sink: Option<W>, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "child output stream closed with error");
                break;
            }
        };
        if let Some(out) = sink.as_mut() {
            if out.write_all(&buf[..n]).await.is_err() || out.flush().await.is_err() {
                sink = None;
            }
        }
        for line in splitter.push(&buf[..n]) {
            if tx.send(line).is_err() {
                return;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send(line);
    }
}

impl DownloadChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take every line queued since the last call, without blocking.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.lines.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Wait briefly for output still buffered after exit.
    pub async fn drain_remaining(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, self.lines.recv()).await {
            lines.push(line);
        }
        lines
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ChildError> {
        self.child.try_wait().map_err(|e| ChildError::Io { source: e })
    }

    /// Stop the process group in place (SIGSTOP).
    pub fn suspend(&self) -> Result<(), ChildError> {
        self.signal(Signal::SIGSTOP)
    }

    /// Continue a stopped process group (SIGCONT).
    pub fn resume(&self) -> Result<(), ChildError> {
        self.signal(Signal::SIGCONT)
    }

    fn signal(&self, signal: Signal) -> Result<(), ChildError> {
        let pid = i32::try_from(self.pid).unwrap_or(0);
        if pid <= 0 {
            return Err(ChildError::Signal {
                signal,
                source: nix::Error::ESRCH,
            });
        }
        killpg(Pid::from_raw(pid), signal).map_err(|e| ChildError::Signal { signal, source: e })
    }

    /// Terminate the process group: SIGTERM, then SIGKILL after `grace`.
    ///
    /// A stopped group is continued right after SIGTERM so it can act on it.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, ChildError> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }

        tracing::debug!(pid = self.pid, grace_secs = grace.as_secs(), "sending SIGTERM to download process group");
        if let Err(e) = self.signal(Signal::SIGTERM) {
            tracing::warn!(error = %e, "graceful termination failed");
        }
        let _ = self.signal(Signal::SIGCONT);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(|e| ChildError::Io { source: e }),
            Err(_) => {
                tracing::warn!(pid = self.pid, "download process ignored SIGTERM, killing");
                if let Err(e) = self.signal(Signal::SIGKILL) {
                    tracing::warn!(error = %e, "SIGKILL to process group failed");
                }
                let _ = self.child.start_kill();
                self.child.wait().await.map_err(|e| ChildError::Io { source: e })
            }
        }
    }
}

/// Human-readable description of an exit status.
pub fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(sig)) => match Signal::try_from(sig) {
            Ok(signal) => format!("killed by {signal}"),
            Err(_) => format!("killed by signal {sig}"),
        },
        (None, None) => "unknown exit status".to_string(),
    }
}
