use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info};

use crate::sampler;

/// Total memory assumed when the host refuses to report one.
const FALLBACK_TOTAL_MEMORY: u64 = 16 * 1024 * 1024 * 1024;

/// How CPU utilization is measured on this host. Chosen once, never re-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStrategy {
    /// Cumulative idle/busy counters, diffed between calls.
    SystemTimes,
    /// Periodically refreshed usage counter with a minimum refresh interval.
    PollingCounter,
}

/// Host characteristics the controllers derive their parameters from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostProfile {
    logical_processors: usize,
    total_memory: u64,
    cpu_strategy: CpuStrategy,
}

impl HostProfile {
    pub fn new(logical_processors: usize, total_memory: u64, cpu_strategy: CpuStrategy) -> Self {
        Self {
            logical_processors: logical_processors.max(1),
            total_memory: if total_memory == 0 {
                FALLBACK_TOTAL_MEMORY
            } else {
                total_memory
            },
            cpu_strategy,
        }
    }

    /// Queries processor count, physical memory and the available CPU counters.
    pub fn detect() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );

        let mut logical_processors = system.cpus().len();
        if logical_processors == 0 {
            debug!("sysinfo reported no cpus, falling back to available_parallelism");
            logical_processors = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }

        let cpu_strategy = if sampler::read_system_times().is_some() {
            CpuStrategy::SystemTimes
        } else {
            CpuStrategy::PollingCounter
        };

        let profile = Self::new(logical_processors, system.total_memory(), cpu_strategy);
        info!(
            logical_processors = profile.logical_processors,
            total_memory_mb = profile.total_memory / 1024 / 1024,
            cpu_strategy = ?profile.cpu_strategy,
            "detected host"
        );
        profile
    }

    pub fn logical_processors(&self) -> usize {
        self.logical_processors
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    pub fn cpu_strategy(&self) -> CpuStrategy {
        self.cpu_strategy
    }

    /// A host without high-resolution system-times counters.
    pub fn is_legacy(&self) -> bool {
        self.cpu_strategy == CpuStrategy::PollingCounter
    }

    /// Consecutive agreeing cycles required before a generator toggles.
    pub fn confirm_threshold(&self) -> u32 {
        if self.is_legacy() { 3 } else { 2 }
    }

    /// Smoothing coefficient for utilization samples.
    pub fn smoothing_alpha(&self) -> f64 {
        match self.cpu_strategy {
            CpuStrategy::SystemTimes => 0.3,
            CpuStrategy::PollingCounter => 0.15,
        }
    }
}
