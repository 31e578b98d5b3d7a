//! Host CPU/memory admission gate for the scheduler
//!
//! Samples global CPU and memory usage (sysinfo) and compares them against
//! configured ceilings. A denied admission enters a cool-down: until it
//! elapses, [`ResourceMonitor::can_admit`] keeps answering `false` without
//! re-sampling, so a loaded host is not hammered with sampling calls and the
//! dispatcher never busy-spins on admission. Denial is a deferral, not an
//! error; the caller simply skips admission for the cycle.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use crate::config::ResourceConfig;

/// Point-in-time host usage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// Global CPU usage, percent (0-100)
    pub cpu_percent: f32,

    /// Memory usage, percent (0-100)
    pub memory_percent: f32,
}

/// Host resource admission gate
pub struct ResourceMonitor {
    system: Mutex<System>,
    max_cpu_percent: f32,
    max_memory_percent: f32,
    cooldown: Duration,
    denied_until: Mutex<Option<Instant>>,
}

impl ResourceMonitor {
    pub fn new(config: &ResourceConfig) -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        system.refresh_all();

        Self {
            system: Mutex::new(system),
            max_cpu_percent: config.max_cpu_percent,
            max_memory_percent: config.max_memory_percent,
            cooldown: Duration::from_secs(config.admission_cooldown_secs),
            denied_until: Mutex::new(None),
        }
    }

    /// Sample current host usage
    pub fn snapshot(&self) -> ResourceUsage {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_all();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_usage();
        let total = system.total_memory();
        let memory_percent = if total > 0 {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };

        ResourceUsage {
            cpu_percent,
            memory_percent,
        }
    }

    /// Whether a new scrape task may be admitted right now.
    ///
    /// Within the cool-down that follows a denial this answers `false`
    /// directly; otherwise the host is sampled and compared against the
    /// configured ceilings.
    pub fn can_admit(&self) -> bool {
        let now = Instant::now();
        {
            let denied = self.denied_until.lock().unwrap();
            if let Some(until) = *denied {
                if now < until {
                    return false;
                }
            }
        }

        let usage = self.snapshot();
        let admitted = usage.cpu_percent <= self.max_cpu_percent
            && usage.memory_percent <= self.max_memory_percent;

        let mut denied = self.denied_until.lock().unwrap();
        if admitted {
            *denied = None;
        } else {
            *denied = Some(now + self.cooldown);
            tracing::warn!(
                cpu = usage.cpu_percent,
                memory = usage.memory_percent,
                max_cpu = self.max_cpu_percent,
                max_memory = self.max_memory_percent,
                cooldown_secs = self.cooldown.as_secs(),
                "admission denied, cooling down"
            );
        }
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(max_cpu: f32, max_mem: f32, cooldown_secs: u64) -> ResourceMonitor {
        ResourceMonitor::new(&ResourceConfig {
            max_cpu_percent: max_cpu,
            max_memory_percent: max_mem,
            admission_cooldown_secs: cooldown_secs,
        })
    }

    #[test]
    fn test_snapshot_in_range() {
        let usage = monitor(80.0, 80.0, 60).snapshot();
        assert!((0.0..=100.0).contains(&usage.cpu_percent));
        assert!((0.0..=100.0).contains(&usage.memory_percent));
    }

    #[test]
    fn test_admits_under_permissive_ceiling() {
        assert!(monitor(100.0, 100.0, 60).can_admit());
    }

    #[test]
    fn test_denies_and_holds_cooldown() {
        // memory ceiling below any real usage forces a denial
        let m = monitor(100.0, -1.0, 3600);
        assert!(!m.can_admit());
        // still inside the cool-down: denied without re-sampling
        assert!(!m.can_admit());
        assert!(m.denied_until.lock().unwrap().is_some());
    }

    #[test]
    fn test_cooldown_expiry_resamples() {
        let m = monitor(100.0, -1.0, 0);
        assert!(!m.can_admit());
        // zero cool-down: next call samples again (and is denied again on merit)
        assert!(!m.can_admit());
    }
}
