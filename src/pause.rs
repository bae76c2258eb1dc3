use crate::resources::ResourceSample;
use std::time::{Duration, Instant};

/// Pause state of the current download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Running,
    Paused { since: Instant },
}

/// What the orchestrator must do to the child after a pause evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseAction {
    None,
    /// Suspend the child; `reason` names the exceeded threshold.
    Pause { reason: String },
    /// Resume the child after `paused_for`.
    Resume { paused_for: Duration },
}

/// Pause bookkeeping kept for the whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseRecord {
    pub count: u32,
    pub total_paused: Duration,
}

/// Decides when host pressure should suspend the download.
///
/// A sample above either threshold pauses the child; it is resumed once
/// `pause_duration` has elapsed regardless of what the host looks like then.
/// If pressure persists the next evaluation pauses it again. Pausing never
/// touches the retry budget.
pub struct PauseController {
    cpu_threshold: f32,
    memory_threshold: f32,
    pause_duration: Duration,
    state: PauseState,
    record: PauseRecord,
}

impl PauseController {
    pub fn new(cpu_threshold: f32, memory_threshold: f32, pause_duration: Duration) -> Self {
        Self {
            cpu_threshold,
            memory_threshold,
            pause_duration,
            state: PauseState::Running,
            record: PauseRecord::default(),
        }
    }

    /// Evaluate one tick. `sample` is `None` when no resource data exists yet.
    pub fn evaluate(&mut self, sample: Option<&ResourceSample>, now: Instant) -> PauseAction {
        match self.state {
            PauseState::Running => {
                let Some(sample) = sample else {
                    return PauseAction::None;
                };
                let Some(reason) = self.pressure_reason(sample) else {
                    return PauseAction::None;
                };
                self.state = PauseState::Paused { since: now };
                self.record.count += 1;
                tracing::info!(
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    pause_count = self.record.count,
                    pause_secs = self.pause_duration.as_secs(),
                    "pausing download: {reason}"
                );
                PauseAction::Pause { reason }
            }
            PauseState::Paused { since } => {
                let paused_for = now.saturating_duration_since(since);
                if paused_for < self.pause_duration {
                    tracing::debug!(
                        paused_secs = paused_for.as_secs(),
                        remaining_secs = (self.pause_duration - paused_for).as_secs(),
                        "download paused"
                    );
                    return PauseAction::None;
                }
                self.finish_pause(paused_for);
                tracing::info!(paused_secs = paused_for.as_secs(), "resuming download");
                PauseAction::Resume { paused_for }
            }
        }
    }

    /// Close an open pause without waiting for the duration, e.g. on shutdown.
    pub fn release(&mut self, now: Instant) -> Option<Duration> {
        match self.state {
            PauseState::Paused { since } => {
                let paused_for = now.saturating_duration_since(since);
                self.finish_pause(paused_for);
                Some(paused_for)
            }
            PauseState::Running => None,
        }
    }

    fn finish_pause(&mut self, paused_for: Duration) {
        self.state = PauseState::Running;
        self.record.total_paused += paused_for;
    }

    fn pressure_reason(&self, sample: &ResourceSample) -> Option<String> {
        if sample.cpu_percent > self.cpu_threshold {
            return Some(format!(
                "CPU usage {:.1}% exceeds threshold {:.1}%",
                sample.cpu_percent, self.cpu_threshold
            ));
        }
        if sample.memory_percent > self.memory_threshold {
            return Some(format!(
                "memory usage {:.1}% exceeds threshold {:.1}%",
                sample.memory_percent, self.memory_threshold
            ));
        }
        None
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, PauseState::Paused { .. })
    }

    pub fn record(&self) -> PauseRecord {
        self.record
    }

    pub fn pause_duration(&self) -> Duration {
        self.pause_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_secs(3);

    fn sample(at: Instant, cpu: f32, memory: f32) -> ResourceSample {
        ResourceSample {
            at,
            cpu_percent: cpu,
            memory_percent: memory,
        }
    }

    fn is_paused(state: PauseState) -> bool {
        matches!(state, PauseState::Paused { .. })
    }

    #[test]
    fn test_cpu_scenario_pauses_for_two_ticks() {
        let mut pause = PauseController::new(80.0, 80.0, TICK * 2);
        let start = Instant::now();

        let mut states = Vec::new();
        for (i, cpu) in [50.0, 85.0, 85.0, 40.0].into_iter().enumerate() {
            let now = start + TICK * i as u32;
            pause.evaluate(Some(&sample(now, cpu, 10.0)), now);
            states.push(is_paused(pause.state));
        }

        assert_eq!(states, vec![false, true, true, false]);
        assert_eq!(pause.record().count, 1);
        assert_eq!(pause.record().total_paused, TICK * 2);
    }

    #[test]
    fn test_memory_pressure_pauses() {
        let mut pause = PauseController::new(80.0, 80.0, TICK);
        let now = Instant::now();
        let action = pause.evaluate(Some(&sample(now, 10.0, 95.0)), now);
        match action {
            PauseAction::Pause { reason } => assert!(reason.contains("memory")),
            other => panic!("expected pause, got {other:?}"),
        }
    }

    #[test]
    fn test_threshold_value_itself_does_not_pause() {
        let mut pause = PauseController::new(80.0, 80.0, TICK);
        let now = Instant::now();
        assert_eq!(pause.evaluate(Some(&sample(now, 80.0, 80.0)), now), PauseAction::None);
        assert!(!pause.is_paused());
    }

    #[test]
    fn test_no_sample_keeps_running() {
        let mut pause = PauseController::new(80.0, 80.0, TICK);
        assert_eq!(pause.evaluate(None, Instant::now()), PauseAction::None);
        assert_eq!(pause.record(), PauseRecord::default());
    }

    #[test]
    fn test_resume_happens_even_under_pressure_then_repauses() {
        let mut pause = PauseController::new(80.0, 80.0, TICK);
        let t0 = Instant::now();
        let t1 = t0 + TICK;
        let t2 = t1 + TICK;

        assert!(matches!(
            pause.evaluate(Some(&sample(t0, 99.0, 10.0)), t0),
            PauseAction::Pause { .. }
        ));
        assert_eq!(
            pause.evaluate(Some(&sample(t1, 99.0, 10.0)), t1),
            PauseAction::Resume { paused_for: TICK }
        );
        assert!(matches!(
            pause.evaluate(Some(&sample(t2, 99.0, 10.0)), t2),
            PauseAction::Pause { .. }
        ));
        assert_eq!(pause.record().count, 2);
    }

    #[test]
    fn test_release_closes_open_pause() {
        let mut pause = PauseController::new(80.0, 80.0, TICK * 10);
        let t0 = Instant::now();
        pause.evaluate(Some(&sample(t0, 99.0, 10.0)), t0);

        assert_eq!(pause.release(t0 + TICK), Some(TICK));
        assert!(!pause.is_paused());
        assert_eq!(pause.record().total_paused, TICK);
        assert_eq!(pause.release(t0 + TICK), None);
    }
}
