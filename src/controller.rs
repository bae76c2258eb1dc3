/// Restart controller: owns the download child and decides, from stalls and
/// exits, whether to restart it, finish, or give up.
///
/// State machine:
/// `Starting -> Downloading` on spawn,
/// `Downloading -> Restarting -> Starting` on a stall or resumable crash while
/// retries remain, `Downloading -> Completed` on exit 0,
/// `Downloading -> Failed` on a non-resumable error or an exhausted budget.
use crate::child::{self, DownloadChild};
use crate::config::{AcceleratorConfig, DownloadConfig};
use crate::failure;
use crate::pause::PauseRecord;
use crate::progress::{self, ProgressReading};
use crate::report::{Reporter, SessionEvent};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::{AttemptEnd, AttemptRecord, DownloadSession, SessionSummary};
use crate::signals::ShutdownSignal;
use crate::speed::{SpeedMonitor, SpeedSample, SpeedVerdict, STALL_WINDOW};
use crate::status::{DownloadState, StatusData, StatusFile};
use chrono::Local;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Output lines kept per attempt for non-resumable error detection.
const OUTPUT_TAIL_LINES: usize = 40;

/// Why the current attempt has to be replaced or judged.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Throughput stayed below threshold for the whole window.
    Stalled { speed_mbps: f64 },
    /// The child exited on its own.
    Exited {
        code: Option<i32>,
        description: String,
        non_resumable: Option<String>,
    },
    /// The download command could not be started.
    SpawnFailed(String),
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Stalled { speed_mbps } => write!(
                f,
                "speed {speed_mbps:.2} MB/s below threshold for {STALL_WINDOW} checks"
            ),
            Trigger::Exited {
                description,
                non_resumable: Some(line),
                ..
            } => write!(f, "download exited ({description}): {line}"),
            Trigger::Exited { description, .. } => write!(f, "download exited ({description})"),
            Trigger::SpawnFailed(error) => write!(f, "{error}"),
        }
    }
}

/// Why a session ended unsuccessfully.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    RetriesExhausted { attempts: u32, last_trigger: String },
    NonResumable(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted {
                attempts,
                last_trigger,
            } => write!(
                f,
                "retries exhausted after {attempts} attempt(s); last: {last_trigger}"
            ),
            FailureReason::NonResumable(line) => write!(f, "non-resumable error: {line}"),
        }
    }
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(FailureReason),
    Interrupted(ShutdownSignal),
}

impl Outcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed => 0,
            Outcome::Failed(_) => 1,
            Outcome::Interrupted(signal) => signal.exit_code(),
        }
    }
}

/// Transition chosen for a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Complete,
    Restart { retry: u32 },
    Fail(FailureReason),
}

/// Result of one controller step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue,
    Finished(Outcome),
}

pub struct RestartController {
    session: DownloadSession,
    download: DownloadConfig,
    terminate_grace: Duration,
    echo: bool,
    state: DownloadState,
    child: Option<DownloadChild>,
    retry: RetryPolicy,
    speed: SpeedMonitor,
    attempts: Vec<AttemptRecord>,
    output_tail: VecDeque<String>,
    last_reading: Option<ProgressReading>,
    paused: bool,
    pauses: u32,
    status: Option<StatusFile>,
    reporter: Arc<dyn Reporter>,
}

impl RestartController {
    pub fn new(
        session: DownloadSession,
        config: &AcceleratorConfig,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            retry: RetryPolicy::new(session.max_retries),
            speed: SpeedMonitor::new(session.speed_threshold_mbps),
            session,
            download: config.download.clone(),
            terminate_grace: config.monitor.terminate_grace(),
            echo: true,
            state: DownloadState::Starting,
            child: None,
            attempts: Vec::new(),
            output_tail: VecDeque::with_capacity(OUTPUT_TAIL_LINES),
            last_reading: None,
            paused: false,
            pauses: 0,
            status: None,
            reporter,
        }
    }

    /// Write a status file on every transition.
    pub fn with_status_file(mut self, status: StatusFile) -> Self {
        tracing::debug!(path = %status.path().display(), "status file enabled");
        self.status = Some(status);
        self
    }

    /// Whether child output is copied to the terminal (default: yes).
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Launch the first attempt.
    pub fn start(&mut self) -> Step {
        tracing::info!(
            artifact = %self.session.artifact,
            threshold_mbps = self.session.speed_threshold_mbps,
            check_interval_secs = self.session.check_interval.as_secs(),
            max_retries = self.session.max_retries,
            "download session starting"
        );
        self.launch()
    }

    /// Spawn a new attempt. Spawn failures consume retries until one succeeds
    /// or the budget runs out.
    fn launch(&mut self) -> Step {
        loop {
            let index = self.attempts.len() as u32 + 1;
            self.attempts.push(AttemptRecord::start(index));
            self.output_tail.clear();
            self.last_reading = None;
            self.speed.reset();
            self.paused = false;
            self.transition(DownloadState::Starting, "launch");

            match child::spawn(&self.download, &self.session.artifact, self.echo) {
                Ok(child) => {
                    let pid = child.pid();
                    self.child = Some(child);
                    self.transition(DownloadState::Downloading, "spawned");
                    self.reporter
                        .report(&SessionEvent::AttemptStarted { attempt: index, pid });
                    return Step::Continue;
                }
                Err(e) => {
                    tracing::error!(attempt = index, error = %e, "failed to start download");
                    self.close_attempt(AttemptEnd::SpawnFailed(e.to_string()));
                    let trigger = Trigger::SpawnFailed(e.to_string());
                    match self.consume_retry(&trigger) {
                        Ok(retry) => self.begin_restart(retry, &trigger),
                        Err(reason) => return Step::Finished(self.finish(Outcome::Failed(reason))),
                    }
                }
            }
        }
    }

    /// Collect output produced since the last call.
    ///
    /// Returns the newest progress reading among the new lines, if any.
    pub fn drain_output(&mut self) -> Option<ProgressReading> {
        let lines = match self.child.as_mut() {
            Some(child) => child.drain_lines(),
            None => return None,
        };
        let latest = self.absorb_lines(lines);
        if let Some(reading) = latest {
            tracing::debug!(
                attempt = self.attempt(),
                percent = reading.percent,
                speed_mbps = ?reading.speed_mbps,
                "progress sample"
            );
        }
        latest
    }

    fn absorb_lines(&mut self, lines: Vec<String>) -> Option<ProgressReading> {
        let mut latest = None;
        for line in lines {
            if let Some(reading) = progress::parse_line(&line) {
                latest = Some(reading);
            }
            if self.output_tail.len() == OUTPUT_TAIL_LINES {
                self.output_tail.pop_front();
            }
            self.output_tail.push_back(line);
        }
        if let Some(reading) = latest {
            self.last_reading = Some(reading);
            if let Some(record) = self.attempts.last_mut() {
                record.last_percent = Some(reading.percent);
            }
        }
        latest
    }

    /// Check whether the child has exited and act on it.
    pub async fn check_exit(&mut self) -> Step {
        let status = match self.child.as_mut().map(|c| c.try_wait()) {
            None | Some(Ok(None)) => return Step::Continue,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "failed to poll download process");
                return Step::Continue;
            }
            Some(Ok(Some(status))) => status,
        };
        let Some(mut child) = self.child.take() else {
            return Step::Continue;
        };
        let remaining = child.drain_remaining().await;
        self.absorb_lines(remaining);
        self.paused = false;

        let description = child::describe_exit(&status);
        tracing::info!(
            pid = child.pid(),
            attempt = self.attempt(),
            status = %description,
            elapsed_secs = child.elapsed().as_secs(),
            "download process exited"
        );
        self.close_attempt(AttemptEnd::Exited(description.clone()));

        let non_resumable = if status.success() {
            None
        } else {
            failure::detect_non_resumable(self.output_tail.iter().map(String::as_str))
        };
        self.handle(Trigger::Exited {
            code: status.code(),
            description,
            non_resumable,
        })
        .await
    }

    /// Feed this check's progress into the stall detector.
    ///
    /// A check with no new progress line counts as 0 MB/s once the attempt
    /// has shown progress below 100%. Lines without a speed are not judged.
    pub async fn check_speed(&mut self, latest: Option<ProgressReading>) -> Step {
        if self.child.is_none() {
            return Step::Continue;
        }
        if self.speed.is_suspended() {
            tracing::trace!(attempt = self.attempt(), "download paused, speed check skipped");
            return Step::Continue;
        }
        let speed_mbps = match latest {
            Some(ProgressReading {
                speed_mbps: Some(speed),
                ..
            }) => speed,
            Some(_) => return Step::Continue,
            None => match self.last_reading {
                Some(last) if last.percent < 100.0 => {
                    tracing::debug!(
                        attempt = self.attempt(),
                        "no progress output since last check, counting as 0 MB/s"
                    );
                    0.0
                }
                _ => return Step::Continue,
            },
        };

        let sample = SpeedSample {
            at: Instant::now(),
            percent: self.last_reading.map(|r| r.percent),
            speed_mbps,
        };
        match self.speed.observe_sample(sample) {
            SpeedVerdict::Healthy => Step::Continue,
            SpeedVerdict::Stalled => {
                let window: Vec<f64> = self.speed.samples().map(|s| s.speed_mbps).collect();
                let slow_for = self
                    .speed
                    .samples()
                    .next()
                    .map(|s| s.at.elapsed().as_secs())
                    .unwrap_or_default();
                tracing::warn!(
                    attempt = self.attempt(),
                    speed_mbps,
                    threshold_mbps = self.speed.threshold_mbps(),
                    low_streak = self.speed.low_streak(),
                    ?window,
                    slow_for_secs = slow_for,
                    "download stalled"
                );
                self.handle(Trigger::Stalled { speed_mbps }).await
            }
        }
    }

    /// Pick the transition for `trigger`, consuming a retry when restarting.
    pub fn decide(&mut self, trigger: &Trigger) -> Decision {
        match trigger {
            Trigger::Exited { code: Some(0), .. } => Decision::Complete,
            Trigger::Exited {
                non_resumable: Some(line),
                ..
            } => Decision::Fail(FailureReason::NonResumable(line.clone())),
            _ => match self.consume_retry(trigger) {
                Ok(retry) => Decision::Restart { retry },
                Err(reason) => Decision::Fail(reason),
            },
        }
    }

    fn consume_retry(&mut self, trigger: &Trigger) -> Result<u32, FailureReason> {
        match self.retry.evaluate() {
            RetryDecision::Retry { retry } => Ok(retry),
            RetryDecision::Exhausted => Err(FailureReason::RetriesExhausted {
                attempts: self.attempts.len() as u32,
                last_trigger: trigger.to_string(),
            }),
        }
    }

    /// Apply the decision for `trigger`.
    pub async fn handle(&mut self, trigger: Trigger) -> Step {
        match self.decide(&trigger) {
            Decision::Complete => Step::Finished(self.finish(Outcome::Completed)),
            Decision::Fail(reason) => {
                if matches!(reason, FailureReason::RetriesExhausted { .. }) {
                    self.transition(DownloadState::Restarting, &trigger.to_string());
                }
                self.stop_child(AttemptEnd::Stopped).await;
                Step::Finished(self.finish(Outcome::Failed(reason)))
            }
            Decision::Restart { retry } => {
                self.begin_restart(retry, &trigger);
                self.stop_child(AttemptEnd::Restarted).await;
                self.launch()
            }
        }
    }

    fn begin_restart(&mut self, retry: u32, trigger: &Trigger) {
        let reason = trigger.to_string();
        self.transition(DownloadState::Restarting, &reason);
        self.reporter.report(&SessionEvent::Restarting {
            attempt: self.attempt(),
            retry,
            max_retries: self.retry.max_retries(),
            reason,
        });
    }

    /// Suspend the child for a resource pause. Never touches the retry budget.
    pub fn suspend(&mut self, reason: String, duration: Duration) {
        if self.paused {
            return;
        }
        if let Some(child) = &self.child {
            if let Err(e) = child.suspend() {
                tracing::warn!(error = %e, "failed to suspend download process");
            }
        }
        self.speed.suspend();
        self.paused = true;
        self.pauses += 1;
        tracing::info!(attempt = self.attempt(), reason = %reason, "download suspended");
        self.write_status();
        self.reporter.report(&SessionEvent::Paused { reason, duration });
    }

    /// Continue a suspended child.
    pub fn resume(&mut self, paused_for: Duration) {
        if !self.paused {
            return;
        }
        if let Some(child) = &self.child {
            if let Err(e) = child.resume() {
                tracing::warn!(error = %e, "failed to resume download process");
            }
        }
        self.speed.resume();
        self.paused = false;
        tracing::info!(
            attempt = self.attempt(),
            paused_secs = paused_for.as_secs(),
            "download resumed"
        );
        self.write_status();
        self.reporter.report(&SessionEvent::Resumed { paused_for });
    }

    /// Stop the child and end the session as interrupted by `signal`.
    pub async fn interrupt(&mut self, signal: ShutdownSignal) -> Outcome {
        self.stop_child(AttemptEnd::Stopped).await;
        self.finish(Outcome::Interrupted(signal))
    }

    async fn stop_child(&mut self, end: AttemptEnd) {
        if let Some(mut child) = self.child.take() {
            match child.terminate(self.terminate_grace).await {
                Ok(status) => tracing::info!(
                    pid = child.pid(),
                    status = %child::describe_exit(&status),
                    "download process stopped"
                ),
                Err(e) => tracing::warn!(error = %e, "failed to stop download process"),
            }
            self.close_attempt(end);
        }
        self.paused = false;
    }

    fn close_attempt(&mut self, end: AttemptEnd) {
        if let Some(record) = self.attempts.last_mut() {
            record.close(end);
        }
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        let (state, event) = match &outcome {
            Outcome::Completed => (
                DownloadState::Completed,
                SessionEvent::Completed {
                    attempts: self.attempts.len() as u32,
                },
            ),
            Outcome::Failed(reason) => (
                DownloadState::Failed,
                SessionEvent::Failed {
                    reason: reason.to_string(),
                },
            ),
            Outcome::Interrupted(_) => (DownloadState::Interrupted, SessionEvent::Interrupted),
        };
        self.transition(state, &event.to_string());
        self.reporter.report(&event);
        if outcome == Outcome::Completed {
            if let Some(status) = &self.status {
                status.remove();
            }
        }
        outcome
    }

    fn transition(&mut self, to: DownloadState, trigger: &str) {
        let from = self.state;
        if from.is_terminal() {
            tracing::warn!(from = ?from, to = ?to, trigger, "ignoring transition out of a terminal state");
            return;
        }
        self.state = to;
        tracing::info!(
            from = ?from,
            to = ?to,
            attempt = self.attempt(),
            retries = self.retry.retries(),
            trigger,
            "state transition"
        );
        self.write_status();
    }

    fn write_status(&self) {
        let Some(file) = &self.status else {
            return;
        };
        let data = StatusData {
            pid: std::process::id(),
            artifact: self.session.artifact.clone(),
            state: self.state,
            attempt: self.attempt(),
            retries: self.retry.retries(),
            max_retries: self.retry.max_retries(),
            paused: self.paused,
            pauses: self.pauses,
            last_percent: self.last_reading.map(|r| r.percent),
            last_speed_mbps: self.last_reading.and_then(|r| r.speed_mbps),
            session_start: self.session.started_at,
            last_update: Local::now(),
        };
        if let Err(e) = file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// 1-based index of the current (or last) attempt.
    pub fn attempt(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.retry.retries()
    }

    pub fn summary(&self, pauses: PauseRecord) -> SessionSummary {
        SessionSummary {
            elapsed: self.session.elapsed(),
            attempts: self.attempt(),
            retries: self.retry.retries(),
            pauses,
        }
    }
}
