use crate::controller::{Outcome, RestartController, Step};
use crate::pause::{PauseAction, PauseController, PauseRecord};
use crate::resources::ResourceMonitor;
use crate::session::SessionSummary;
use crate::signals::ShutdownSignal;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Host-pressure pausing, present only in the advanced variant.
pub struct PressureControl {
    pub monitor: ResourceMonitor,
    pub pause: PauseController,
}

/// Top-level control loop.
///
/// Every check interval: drain child output, check for exit, evaluate host
/// pressure (advanced variant), then evaluate throughput. Pressure comes
/// first so a paused tick never judges a stall.
pub struct Orchestrator {
    controller: RestartController,
    pressure: Option<PressureControl>,
    check_interval: Duration,
}

impl Orchestrator {
    pub fn new(controller: RestartController, check_interval: Duration) -> Self {
        Self {
            controller,
            pressure: None,
            check_interval,
        }
    }

    /// Enable pausing on CPU/memory pressure.
    pub fn with_pressure_control(mut self, monitor: ResourceMonitor, pause: PauseController) -> Self {
        self.pressure = Some(PressureControl { monitor, pause });
        self
    }

    /// Run until the download completes, fails, or `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F) -> Outcome
    where
        F: Future<Output = ShutdownSignal>,
    {
        tokio::pin!(shutdown);

        if let Step::Finished(outcome) = self.controller.start() {
            return outcome;
        }

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; start measuring from the spawn
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                signal = &mut shutdown => {
                    tracing::warn!(attempt = self.controller.attempt(), ?signal, "shutdown requested, stopping download");
                    self.close_open_pause("shutdown");
                    return self.controller.interrupt(signal).await;
                }
                _ = ticker.tick() => {
                    if let Step::Finished(outcome) = self.tick().await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn tick(&mut self) -> Step {
        let latest = self.controller.drain_output();

        let attempt = self.controller.attempt();
        let step = self.controller.check_exit().await;
        if let Step::Finished(_) = step {
            self.close_open_pause("session end");
            return step;
        }
        if self.controller.attempt() != attempt {
            // The child was replaced; a pause on the old one is moot
            self.close_open_pause("restart");
            return Step::Continue;
        }

        if let Some(pressure) = self.pressure.as_mut() {
            let sample = pressure.monitor.sample();
            match pressure.pause.evaluate(sample.as_ref(), Instant::now()) {
                PauseAction::Pause { reason } => {
                    self.controller.suspend(reason, pressure.pause.pause_duration())
                }
                PauseAction::Resume { paused_for } => self.controller.resume(paused_for),
                PauseAction::None => {}
            }
            if pressure.pause.is_paused() {
                return Step::Continue;
            }
        }

        self.controller.check_speed(latest).await
    }

    /// Count an open pause into the record when its child goes away.
    fn close_open_pause(&mut self, cause: &str) {
        if let Some(pressure) = self.pressure.as_mut() {
            if let Some(paused_for) = pressure.pause.release(Instant::now()) {
                tracing::debug!(paused_secs = paused_for.as_secs(), cause, "pause closed");
            }
        }
    }

    pub fn pause_record(&self) -> PauseRecord {
        self.pressure
            .as_ref()
            .map(|p| p.pause.record())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> SessionSummary {
        self.controller.summary(self.pause_record())
    }

    pub fn controller(&self) -> &RestartController {
        &self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcceleratorConfig, DownloadConfig};
    use crate::controller::FailureReason;
    use crate::report::tests::RecordingReporter;
    use crate::report::SessionEvent;
    use crate::resources::tests::ScriptedProbe;
    use crate::session::{AttemptEnd, DownloadSession};
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(50);

    /// Prints a slow progress line every 20ms forever.
    const SLOW_FOREVER: &str = "while true; do echo 'pulling 10% 0.1 MB/s'; sleep 0.02; done";

    fn orchestrator(script: &str, max_retries: u32) -> (Orchestrator, Arc<RecordingReporter>) {
        let mut config = AcceleratorConfig::default();
        config.download = DownloadConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        };
        config.monitor.max_retries = max_retries;
        config.monitor.speed_threshold_mbps = 1.0;

        let reporter = Arc::new(RecordingReporter::default());
        let session = DownloadSession::new("test-model", &config);
        let controller = RestartController::new(session, &config, reporter.clone())
            .with_echo(false)
            .with_terminate_grace(Duration::from_secs(2));
        (Orchestrator::new(controller, TICK), reporter)
    }

    fn never() -> std::future::Pending<ShutdownSignal> {
        std::future::pending()
    }

    async fn interrupt_after(delay: Duration) -> ShutdownSignal {
        tokio::time::sleep(delay).await;
        ShutdownSignal::Interrupt
    }

    fn count(events: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[tokio::test]
    async fn test_fast_download_completes() {
        let (mut orch, reporter) = orchestrator(
            "echo 'pulling 50% 20 MB/s'; sleep 0.1; echo 'pulling 100% 20 MB/s'; echo success",
            2,
        );
        let outcome = orch.run(never()).await;
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(orch.summary().retries, 0);
        assert_eq!(orch.summary().attempts, 1);
        assert_eq!(
            reporter.events().last(),
            Some(&SessionEvent::Completed { attempts: 1 })
        );
    }

    #[tokio::test]
    async fn test_persistent_stall_exhausts_retries() {
        let (mut orch, reporter) = orchestrator(SLOW_FOREVER, 2);
        let outcome = orch.run(never()).await;

        assert!(matches!(
            outcome,
            Outcome::Failed(FailureReason::RetriesExhausted { attempts: 3, .. })
        ));
        let summary = orch.summary();
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.attempts, 3);

        let events = reporter.events();
        assert_eq!(count(&events, |e| matches!(e, SessionEvent::AttemptStarted { .. })), 3);
        assert_eq!(count(&events, |e| matches!(e, SessionEvent::Restarting { .. })), 2);
        assert!(matches!(events.last(), Some(SessionEvent::Failed { .. })));
        assert!(orch.controller().attempts().iter().all(|a| !a.is_running()));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("partial");
        let script = format!(
            "if [ -f '{m}' ]; then echo 'pulling 60% 40 MB/s'; sleep 0.1; echo 'pulling 100% 40 MB/s'; exit 0; fi; \
             touch '{m}'; {slow}",
            m = marker.display(),
            slow = SLOW_FOREVER
        );
        let (mut orch, _) = orchestrator(&script, 5);

        assert_eq!(orch.run(never()).await, Outcome::Completed);
        assert_eq!(orch.summary().retries, 1);
        assert_eq!(
            orch.controller().attempts()[0].end,
            Some(AttemptEnd::Restarted)
        );
    }

    #[tokio::test]
    async fn test_non_resumable_error_fails_without_retry() {
        let (mut orch, _) = orchestrator(
            "echo 'pulling manifest'; echo 'Error: pull model manifest: file does not exist'; exit 1",
            5,
        );
        let outcome = orch.run(never()).await;
        assert!(matches!(outcome, Outcome::Failed(FailureReason::NonResumable(_))));
        assert_eq!(orch.summary().retries, 0);
    }

    #[tokio::test]
    async fn test_interrupt_terminates_child() {
        let (mut orch, reporter) = orchestrator("sleep 30", 5);
        let start = Instant::now();
        let outcome = orch.run(interrupt_after(Duration::from_millis(200))).await;

        assert_eq!(outcome, Outcome::Interrupted(ShutdownSignal::Interrupt));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(orch.controller().attempts()[0].end, Some(AttemptEnd::Stopped));
        assert_eq!(reporter.events().last(), Some(&SessionEvent::Interrupted));
    }

    #[tokio::test]
    async fn test_pressure_pauses_instead_of_restarting() {
        let (orch, reporter) = orchestrator(SLOW_FOREVER, 0);
        // Host stays overloaded; the monitor keeps replaying the last sample
        let monitor = ResourceMonitor::new(Box::new(ScriptedProbe::new(vec![Some((95.0, 10.0))])));
        let pause = PauseController::new(80.0, 80.0, TICK * 3);
        let mut orch = orch.with_pressure_control(monitor, pause);

        let outcome = orch.run(interrupt_after(Duration::from_millis(700))).await;

        // With zero retries any stall would have failed the session
        assert_eq!(outcome, Outcome::Interrupted(ShutdownSignal::Interrupt));
        assert_eq!(orch.summary().retries, 0);
        assert!(orch.pause_record().count >= 1);

        let events = reporter.events();
        assert!(count(&events, |e| matches!(e, SessionEvent::Paused { .. })) >= 1);
        assert_eq!(count(&events, |e| matches!(e, SessionEvent::Restarting { .. })), 0);
    }

    #[tokio::test]
    async fn test_pressure_on_third_slow_tick_wins_over_stall() {
        let (orch, reporter) = orchestrator(SLOW_FOREVER, 0);
        // Two quiet ticks record slow readings; the host spikes on the tick
        // that would complete the stall window and stays loaded after that
        let monitor = ResourceMonitor::new(Box::new(ScriptedProbe::new(vec![
            Some((10.0, 10.0)),
            Some((10.0, 10.0)),
            Some((95.0, 10.0)),
        ])));
        let pause = PauseController::new(80.0, 80.0, TICK * 100);
        let mut orch = orch.with_pressure_control(monitor, pause);

        let outcome = orch.run(interrupt_after(Duration::from_millis(400))).await;

        assert_eq!(outcome, Outcome::Interrupted(ShutdownSignal::Interrupt));
        assert_eq!(orch.summary().retries, 0);
        assert_eq!(orch.pause_record().count, 1);
        let events = reporter.events();
        assert_eq!(count(&events, |e| matches!(e, SessionEvent::Paused { .. })), 1);
        assert_eq!(count(&events, |e| matches!(e, SessionEvent::Failed { .. })), 0);
    }

    #[tokio::test]
    async fn test_pause_is_recorded_when_paused_child_ends_session() {
        let (orch, reporter) = orchestrator(SLOW_FOREVER, 0);
        let monitor = ResourceMonitor::new(Box::new(ScriptedProbe::new(vec![Some((95.0, 10.0))])));
        let pause = PauseController::new(80.0, 80.0, TICK * 100);
        let mut orch = orch.with_pressure_control(monitor, pause);

        // Kill the suspended download from outside, as an OOM killer would
        let killer = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let pid = reporter
                .events()
                .iter()
                .find_map(|e| match e {
                    SessionEvent::AttemptStarted { pid, .. } => Some(*pid),
                    _ => None,
                })
                .unwrap();
            nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            )
            .unwrap();
        };
        let (outcome, ()) = tokio::join!(orch.run(never()), killer);

        assert!(matches!(
            outcome,
            Outcome::Failed(FailureReason::RetriesExhausted { attempts: 1, .. })
        ));
        let record = orch.pause_record();
        assert_eq!(record.count, 1);
        assert!(
            record.total_paused >= Duration::from_millis(100),
            "open pause should be counted, got {:?}",
            record.total_paused
        );
    }

    #[tokio::test]
    async fn test_without_pressure_control_pause_record_is_empty() {
        let (mut orch, _) = orchestrator("exit 0", 0);
        assert_eq!(orch.run(never()).await, Outcome::Completed);
        assert_eq!(orch.pause_record(), PauseRecord::default());
    }
}
