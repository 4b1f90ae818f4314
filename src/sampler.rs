use std::time::{Duration, Instant};

use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, MemoryRefreshKind, System};
use tracing::{debug, trace};

use crate::filter::SmoothingFilter;
use crate::host::{CpuStrategy, HostProfile};

/// Polling counters are never refreshed more often than this.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One smoothed reading of system-wide utilization.
#[derive(Debug, Clone, Copy)]
pub struct UtilizationSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub timestamp: Instant,
}

/// Cumulative CPU time counters, in clock ticks since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTimes {
    pub idle: u64,
    pub total: u64,
}

impl SystemTimes {
    /// Busy percentage between `previous` and `self`, or `None` if no time elapsed.
    pub fn busy_percent_since(&self, previous: &SystemTimes) -> Option<f64> {
        let total_delta = self.total.saturating_sub(previous.total);
        if total_delta == 0 {
            return None;
        }
        let idle_delta = self.idle.saturating_sub(previous.idle).min(total_delta);
        let busy = (total_delta - idle_delta) as f64 / total_delta as f64 * 100.0;
        Some(busy.clamp(0.0, 100.0))
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
pub fn parse_proc_stat(contents: &str) -> Option<SystemTimes> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }

    // user nice system idle iowait irq softirq steal; guest time is already in user.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().take(8).sum();
    Some(SystemTimes { idle, total })
}

#[cfg(target_os = "linux")]
pub(crate) fn read_system_times() -> Option<SystemTimes> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    parse_proc_stat(&contents)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_system_times() -> Option<SystemTimes> {
    None
}

/// Produces one snapshot of the cumulative CPU time counters.
type TimesReader = Box<dyn FnMut() -> Option<SystemTimes> + Send>;

enum CpuSource {
    SystemTimes {
        read: TimesReader,
        previous: Option<SystemTimes>,
    },
    PollingCounter {
        last_poll: Instant,
        min_interval: Duration,
    },
}

/// Best-effort, smoothed measurement of system-wide CPU and memory utilization.
///
/// Measurement failures never surface: the last known value (or 0 before the first
/// successful reading) is returned instead.
pub struct UtilizationSampler {
    system: System,
    cpu_source: CpuSource,
    cpu_filter: SmoothingFilter,
    mem_filter: SmoothingFilter,
}

impl UtilizationSampler {
    pub fn new(host: &HostProfile) -> Self {
        let alpha = host.smoothing_alpha();
        match host.cpu_strategy() {
            CpuStrategy::SystemTimes => {
                Self::with_times_reader(alpha, Box::new(read_system_times))
            }
            CpuStrategy::PollingCounter => {
                let mut system = System::new();
                system.refresh_cpu_usage();
                let cpu_source = CpuSource::PollingCounter {
                    last_poll: Instant::now(),
                    min_interval: MIN_POLL_INTERVAL.max(MINIMUM_CPU_UPDATE_INTERVAL),
                };
                Self::with_source(system, cpu_source, alpha)
            }
        }
    }

    /// Samples CPU from cumulative counters produced by `read`. The first snapshot is
    /// taken immediately and only serves as the baseline.
    fn with_times_reader(alpha: f64, mut read: TimesReader) -> Self {
        let previous = read();
        Self::with_source(System::new(), CpuSource::SystemTimes { read, previous }, alpha)
    }

    fn with_source(system: System, cpu_source: CpuSource, alpha: f64) -> Self {
        Self {
            system,
            cpu_source,
            cpu_filter: SmoothingFilter::new(alpha),
            mem_filter: SmoothingFilter::new(alpha),
        }
    }

    /// Smoothed system-wide CPU utilization in percent.
    pub fn cpu_usage(&mut self) -> f64 {
        match self.raw_cpu_usage() {
            Some(raw) => self.cpu_filter.update(raw),
            None => self.cpu_filter.value(),
        }
    }

    fn raw_cpu_usage(&mut self) -> Option<f64> {
        match &mut self.cpu_source {
            CpuSource::SystemTimes { read, previous } => {
                let Some(current) = read() else {
                    debug!("system times unavailable, keeping last cpu value");
                    return None;
                };
                let busy = previous
                    .as_ref()
                    .and_then(|prev| current.busy_percent_since(prev));
                *previous = Some(current);
                busy
            }
            CpuSource::PollingCounter {
                last_poll,
                min_interval,
            } => {
                if last_poll.elapsed() < *min_interval {
                    trace!("cpu counter polled too soon, keeping last cpu value");
                    return None;
                }
                self.system.refresh_cpu_usage();
                *last_poll = Instant::now();
                let usage = f64::from(self.system.global_cpu_usage());
                usage.is_finite().then(|| usage.clamp(0.0, 100.0))
            }
        }
    }

    /// Smoothed physical memory utilization in percent.
    pub fn memory_usage(&mut self) -> f64 {
        self.system
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        let total = self.system.total_memory();
        if total == 0 {
            debug!("total memory reported as zero, keeping last memory value");
            return self.mem_filter.value();
        }
        let used = total.saturating_sub(self.system.available_memory());
        let raw = (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
        self.mem_filter.update(raw)
    }

    pub fn sample(&mut self) -> UtilizationSample {
        UtilizationSample {
            cpu_percent: self.cpu_usage(),
            mem_percent: self.memory_usage(),
            timestamp: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "cpu  4705 356 584 3699 23 23 0 0 0 0\n\
                             cpu0 1393 280 278 1837 10 9 0 0 0 0\n\
                             intr 114930548 113199788 3 0 5 263 0 4 [...]\n";

    #[test]
    fn test_parse_aggregate_line() {
        let times = parse_proc_stat(PROC_STAT).unwrap();
        assert_eq!(times.idle, 3699 + 23);
        assert_eq!(times.total, 4705 + 356 + 584 + 3699 + 23 + 23);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_proc_stat("").is_none());
        assert!(parse_proc_stat("cpu  1 2\n").is_none());
        assert!(parse_proc_stat("cpu  a b c d\n").is_none());
    }

    #[test]
    fn test_busy_percent() {
        let prev = SystemTimes { idle: 100, total: 200 };
        let cur = SystemTimes { idle: 130, total: 300 };
        assert_eq!(cur.busy_percent_since(&prev), Some(70.0));
    }

    #[test]
    fn test_busy_percent_without_elapsed_time() {
        let prev = SystemTimes { idle: 100, total: 200 };
        assert_eq!(prev.busy_percent_since(&prev), None);
    }

    #[test]
    fn test_busy_percent_counter_wrap_is_clamped() {
        let prev = SystemTimes { idle: 500, total: 200 };
        let cur = SystemTimes { idle: 100, total: 300 };
        assert_eq!(cur.busy_percent_since(&prev), Some(100.0));
    }

    #[test]
    fn test_readings_stay_in_range() {
        let host = HostProfile::detect();
        let mut sampler = UtilizationSampler::new(&host);
        for _ in 0..3 {
            let sample = sampler.sample();
            assert!((0.0..=100.0).contains(&sample.cpu_percent));
            assert!((0.0..=100.0).contains(&sample.mem_percent));
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(sampler.memory_usage() > 0.0);
    }

    /// A reader replaying `snapshots` in order, then failing.
    fn replay(snapshots: Vec<Option<SystemTimes>>) -> TimesReader {
        let mut snapshots = snapshots.into_iter();
        Box::new(move || snapshots.next().flatten())
    }

    fn times(idle: u64, total: u64) -> Option<SystemTimes> {
        Some(SystemTimes { idle, total })
    }

    #[test]
    fn test_system_times_filter_waits_for_first_delta() {
        let mut sampler = UtilizationSampler::with_times_reader(0.3, replay(vec![times(100, 200)]));
        assert!(!sampler.cpu_filter.is_initialized());

        // The baseline alone yields no delta, and the following read fails.
        assert_eq!(sampler.cpu_usage(), 0.0);
        assert!(!sampler.cpu_filter.is_initialized());
    }

    #[test]
    fn test_system_times_identical_snapshot_returns_cached_value() {
        let mut sampler = UtilizationSampler::with_times_reader(
            0.3,
            replay(vec![times(100, 200), times(130, 300), times(130, 300), times(190, 400)]),
        );

        assert_eq!(sampler.cpu_usage(), 70.0);
        assert_eq!(sampler.cpu_usage(), 70.0);

        // The identical snapshot was not fed to the filter: 0.3 * 40 + 0.7 * 70.
        let next = sampler.cpu_usage();
        assert!((next - 61.0).abs() < 1e-9, "got {next}");
    }

    #[test]
    fn test_system_times_failed_read_returns_previous_value() {
        let mut sampler = UtilizationSampler::with_times_reader(
            0.3,
            replay(vec![times(100, 200), times(150, 300), None, times(200, 400)]),
        );

        assert_eq!(sampler.cpu_usage(), 50.0);
        assert_eq!(sampler.cpu_usage(), 50.0);
        assert!(sampler.cpu_filter.is_initialized());

        // The baseline survives the failed read, so the next delta is 50% again.
        let next = sampler.cpu_usage();
        assert!((next - 50.0).abs() < 1e-9, "got {next}");
    }

    #[test]
    fn test_polling_counter_returns_cached_value_when_polled_too_soon() {
        let host = HostProfile::new(4, 8 << 30, CpuStrategy::PollingCounter);
        let mut sampler = UtilizationSampler::new(&host);
        assert_eq!(sampler.cpu_usage(), 0.0);
        assert!(!sampler.cpu_filter.is_initialized());
    }
}
