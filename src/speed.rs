use std::collections::VecDeque;
use std::time::Instant;

/// Consecutive low readings that make a stall.
pub const STALL_WINDOW: usize = 3;

/// Readings dropped after a resume before stall evaluation restarts.
pub const RESUME_GRACE_SAMPLES: u32 = 2;

/// Verdict returned by the speed monitor for each observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedVerdict {
    Healthy,
    Stalled,
}

/// One recorded throughput reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub at: Instant,
    pub percent: Option<f64>,
    pub speed_mbps: f64,
}

/// Rolling stall detector.
///
/// Keeps the last [`STALL_WINDOW`] readings and reports `Stalled` when every
/// one of them is below the threshold. With fewer readings than the window
/// it always reports `Healthy`, which gives a fresh attempt a two-sample
/// grace period after [`reset`](Self::reset).
pub struct SpeedMonitor {
    threshold_mbps: f64,
    window: VecDeque<SpeedSample>,
    suspended: bool,
    grace_remaining: u32,
}

impl SpeedMonitor {
    pub fn new(threshold_mbps: f64) -> Self {
        Self {
            threshold_mbps,
            window: VecDeque::with_capacity(STALL_WINDOW),
            suspended: false,
            grace_remaining: 0,
        }
    }

    /// Record a bare speed reading and evaluate the window.
    #[allow(dead_code)]
    pub fn observe(&mut self, speed_mbps: f64) -> SpeedVerdict {
        self.observe_sample(SpeedSample {
            at: Instant::now(),
            percent: None,
            speed_mbps,
        })
    }

    /// Record a reading taken by the control loop and evaluate the window.
    pub fn observe_sample(&mut self, sample: SpeedSample) -> SpeedVerdict {
        if self.suspended {
            tracing::trace!(speed = sample.speed_mbps, "speed sample dropped while paused");
            return SpeedVerdict::Healthy;
        }
        if self.grace_remaining > 0 {
            self.grace_remaining -= 1;
            tracing::debug!(
                speed = sample.speed_mbps,
                grace_remaining = self.grace_remaining,
                "speed sample dropped during resume grace period"
            );
            return SpeedVerdict::Healthy;
        }

        if self.window.len() == STALL_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        let low = self
            .window
            .iter()
            .filter(|s| s.speed_mbps < self.threshold_mbps)
            .count();
        tracing::debug!(
            speed = sample.speed_mbps,
            percent = ?sample.percent,
            threshold = self.threshold_mbps,
            low,
            window = STALL_WINDOW,
            "speed sample recorded"
        );

        if self.window.len() == STALL_WINDOW && low == STALL_WINDOW {
            SpeedVerdict::Stalled
        } else {
            SpeedVerdict::Healthy
        }
    }

    /// Discard history. Called on every restart.
    pub fn reset(&mut self) {
        self.window.clear();
        self.suspended = false;
        self.grace_remaining = 0;
    }

    /// Stop recording while the child is paused. The window is kept as is.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Resume recording after a pause, skipping the first readings.
    pub fn resume(&mut self) {
        self.suspended = false;
        self.grace_remaining = RESUME_GRACE_SAMPLES;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Number of consecutive below-threshold readings at the end of the window.
    pub fn low_streak(&self) -> usize {
        self.window
            .iter()
            .rev()
            .take_while(|s| s.speed_mbps < self.threshold_mbps)
            .count()
    }

    pub fn samples(&self) -> impl Iterator<Item = &SpeedSample> {
        self.window.iter()
    }

    pub fn threshold_mbps(&self) -> f64 {
        self.threshold_mbps
    }
}
