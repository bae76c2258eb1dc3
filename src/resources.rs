/// Host CPU and memory sampling for the pause-on-pressure variant.
use std::time::Instant;
use sysinfo::System;

/// Host utilization at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub at: Instant,
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of raw utilization readings.
///
/// Returns `None` when the OS query produced no usable data.
pub trait ResourceProbe: Send {
    fn read(&mut self) -> Option<(f32, f32)>;
}

/// `sysinfo`-backed probe for the local host.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one
        system.refresh_cpu();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn read(&mut self) -> Option<(f32, f32)> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 || self.system.cpus().is_empty() {
            return None;
        }
        let cpu = self.system.global_cpu_info().cpu_usage();
        let memory = (self.system.used_memory() as f64 / total as f64 * 100.0) as f32;
        if !cpu.is_finite() || !memory.is_finite() {
            return None;
        }
        Some((cpu, memory))
    }
}

/// Samples host utilization, degrading to the last good reading on failure.
pub struct ResourceMonitor {
    probe: Box<dyn ResourceProbe>,
    last_good: Option<ResourceSample>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            last_good: None,
        }
    }

    /// Monitor for the local host.
    pub fn system() -> Self {
        Self::new(Box::new(SysinfoProbe::new()))
    }

    /// Current utilization, or the last known-good value if the query fails.
    ///
    /// Returns `None` only when no query has ever succeeded.
    pub fn sample(&mut self) -> Option<ResourceSample> {
        match self.probe.read() {
            Some((cpu_percent, memory_percent)) => {
                let sample = ResourceSample {
                    at: Instant::now(),
                    cpu_percent,
                    memory_percent,
                };
                tracing::debug!(cpu = cpu_percent, memory = memory_percent, "resource sample");
                self.last_good = Some(sample);
                Some(sample)
            }
            None => {
                tracing::warn!(
                    fallback_age_secs = ?self.last_good.map(|s| s.at.elapsed().as_secs()),
                    "resource query failed, using last known-good sample"
                );
                self.last_good
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Probe that replays a fixed script of readings.
    pub(crate) struct ScriptedProbe {
        readings: VecDeque<Option<(f32, f32)>>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(readings: Vec<Option<(f32, f32)>>) -> Self {
            Self {
                readings: readings.into(),
            }
        }
    }

    impl ResourceProbe for ScriptedProbe {
        fn read(&mut self) -> Option<(f32, f32)> {
            self.readings.pop_front().flatten()
        }
    }

    #[test]
    fn test_sample_returns_probe_values() {
        let mut monitor = ResourceMonitor::new(Box::new(ScriptedProbe::new(vec![Some((
            42.0, 61.5,
        ))])));
        let sample = monitor.sample().unwrap();
        assert_eq!(sample.cpu_percent, 42.0);
        assert_eq!(sample.memory_percent, 61.5);
    }

    #[test]
    fn test_failure_falls_back_to_last_good() {
        let mut monitor = ResourceMonitor::new(Box::new(ScriptedProbe::new(vec![
            Some((30.0, 40.0)),
            None,
            Some((90.0, 10.0)),
        ])));
        let first = monitor.sample().unwrap();
        let degraded = monitor.sample().unwrap();
        assert_eq!(degraded, first);

        let recovered = monitor.sample().unwrap();
        assert_eq!(recovered.cpu_percent, 90.0);
        assert_eq!(monitor.last_good, Some(recovered));
    }

    #[test]
    fn test_failure_before_any_success_yields_none() {
        let mut monitor = ResourceMonitor::new(Box::new(ScriptedProbe::new(vec![None])));
        assert_eq!(monitor.sample(), None);
    }

    #[test]
    fn test_sysinfo_probe_reports_percentages() {
        let mut probe = SysinfoProbe::new();
        std::thread::sleep(std::time::Duration::from_millis(300));
        if let Some((cpu, memory)) = probe.read() {
            assert!((0.0..=100.0).contains(&memory));
            assert!(cpu >= 0.0);
        }
    }
}
