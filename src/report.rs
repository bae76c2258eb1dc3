/// High-level session events and the reporter that shows them to the user.
///
/// Only these events reach the console; samples and decisions go to the log
/// file through `tracing`. Keeping the console quiet avoids clobbering the
/// download tool's own progress bar.
use std::time::Duration;

/// A user-visible session event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AttemptStarted {
        attempt: u32,
        pid: u32,
    },
    Restarting {
        attempt: u32,
        retry: u32,
        max_retries: u32,
        reason: String,
    },
    Paused {
        reason: String,
        duration: Duration,
    },
    Resumed {
        paused_for: Duration,
    },
    Completed {
        attempts: u32,
    },
    Failed {
        reason: String,
    },
    Interrupted,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::AttemptStarted { attempt, pid } => {
                write!(f, "Attempt {attempt} started (pid {pid})")
            }
            SessionEvent::Restarting {
                attempt,
                retry,
                max_retries,
                reason,
            } => write!(
                f,
                "Restarting after attempt {attempt}: {reason} (retry {retry}/{max_retries})"
            ),
            SessionEvent::Paused { reason, duration } => {
                write!(f, "Pausing download for {} s: {reason}", duration.as_secs())
            }
            SessionEvent::Resumed { paused_for } => {
                write!(f, "Resuming download after {} s", paused_for.as_secs())
            }
            SessionEvent::Completed { attempts } => {
                write!(f, "Download completed after {attempts} attempt(s)")
            }
            SessionEvent::Failed { reason } => write!(f, "Download failed: {reason}"),
            SessionEvent::Interrupted => write!(f, "Download interrupted by user"),
        }
    }
}

/// Receives session events. Injected into the controller and orchestrator.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &SessionEvent);
}

/// Prints events to stderr on their own line.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, event: &SessionEvent) {
        // Leading newline: the child's progress bar may own the current line
        eprintln!("\n[accelerator] {event}");
    }
}
