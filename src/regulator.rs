use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, instrument};

use crate::compute::ComputeLoadGenerator;
use crate::config::RegulatorConfig;
use crate::host::HostProfile;
use crate::hysteresis::{Hysteresis, Transition};
use crate::memory::MemoryLoadGenerator;
use crate::sampler::UtilizationSampler;

/// Granularity at which [`RegulatorLoop::run`] checks for shutdown between cycles.
const TICK: Duration = Duration::from_millis(100);

/// Control surface the regulator drives. Implementations absorb their own failures.
#[cfg_attr(test, mockall::automock)]
pub trait LoadGenerator: Send {
    fn start(&self);
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// The generator's own contribution to total utilization, in percent.
    fn usage(&self) -> f64;
    fn adjust_load(&self, current_own_usage: f64, target_own_usage: f64);
    /// Generator-specific load level for status reporting.
    fn load_level(&self) -> u64;
}

/// Source of total system utilization readings, in percent.
#[cfg_attr(test, mockall::automock)]
pub trait UtilizationSource: Send {
    fn cpu_usage(&mut self) -> f64;
    fn memory_usage(&mut self) -> f64;
}

impl LoadGenerator for ComputeLoadGenerator {
    fn start(&self) {
        ComputeLoadGenerator::start(self)
    }

    fn stop(&self) {
        ComputeLoadGenerator::stop(self)
    }

    fn is_running(&self) -> bool {
        ComputeLoadGenerator::is_running(self)
    }

    fn usage(&self) -> f64 {
        ComputeLoadGenerator::usage(self)
    }

    fn adjust_load(&self, current_own_usage: f64, target_own_usage: f64) {
        ComputeLoadGenerator::adjust_load(self, current_own_usage, target_own_usage)
    }

    /// Current duty-cycle intensity.
    fn load_level(&self) -> u64 {
        u64::from(self.intensity())
    }
}

impl LoadGenerator for MemoryLoadGenerator {
    fn start(&self) {
        MemoryLoadGenerator::start(self)
    }

    fn stop(&self) {
        MemoryLoadGenerator::stop(self)
    }

    fn is_running(&self) -> bool {
        MemoryLoadGenerator::is_running(self)
    }

    fn usage(&self) -> f64 {
        MemoryLoadGenerator::usage(self)
    }

    fn adjust_load(&self, current_own_usage: f64, target_own_usage: f64) {
        MemoryLoadGenerator::adjust_load(self, current_own_usage, target_own_usage)
    }

    /// Committed memory in MiB.
    fn load_level(&self) -> u64 {
        self.allocated_mb()
    }
}

impl UtilizationSource for UtilizationSampler {
    fn cpu_usage(&mut self) -> f64 {
        UtilizationSampler::cpu_usage(self)
    }

    fn memory_usage(&mut self) -> f64 {
        UtilizationSampler::memory_usage(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cpu,
    Memory,
}

impl Resource {
    /// Upper bound on the share a generator of this kind may target. Memory keeps
    /// headroom.
    pub fn target_cap(self) -> f64 {
        match self {
            Resource::Cpu => 100.0,
            Resource::Memory => 80.0,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cpu => f.write_str("cpu"),
            Resource::Memory => f.write_str("mem"),
        }
    }
}

/// Per-resource result of one regulator cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceReport {
    pub total: f64,
    pub own: f64,
    pub other: f64,
    pub active: bool,
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub cpu: ResourceReport,
    pub memory: ResourceReport,
    /// Compute intensity after this cycle's adjustment.
    pub intensity: u32,
    /// Memory held by the memory generator after this cycle, in MiB.
    pub allocated_mb: u64,
}

struct Channel<G> {
    resource: Resource,
    generator: G,
    hysteresis: Hysteresis,
}

impl<G: LoadGenerator> Channel<G> {
    fn regulate(&mut self, total: f64, workers_enabled: bool) -> ResourceReport {
        let own = if self.generator.is_running() {
            self.generator.usage()
        } else {
            0.0
        };
        let other = (total - own).max(0.0);
        let threshold = self.hysteresis.threshold();

        let mut report = ResourceReport {
            total,
            own,
            other,
            active: false,
            target: None,
        };
        if !workers_enabled {
            return report;
        }

        match self.hysteresis.observe(other) {
            Transition::Activated => {
                self.generator.start();
                info!(
                    resource = %self.resource,
                    other = format_args!("{other:.1}"),
                    threshold,
                    "other usage below threshold, starting load"
                );
            }
            Transition::Deactivated => {
                self.generator.stop();
                info!(
                    resource = %self.resource,
                    other = format_args!("{other:.1}"),
                    threshold,
                    "other usage above threshold, stopping load"
                );
            }
            Transition::Unchanged => {}
        }

        report.active = self.hysteresis.is_active();
        if report.active && self.generator.is_running() {
            let target = (threshold - other).clamp(0.0, self.resource.target_cap());
            self.generator.adjust_load(own, target);
            report.target = Some(target);
        }
        report
    }
}

/// Polls utilization on a fixed cadence and drives both load generators toward their
/// thresholds.
pub struct RegulatorLoop<S, C, M> {
    source: S,
    cpu: Channel<C>,
    memory: Channel<M>,
    poll_interval: Duration,
    workers_enabled: bool,
}

impl RegulatorLoop<UtilizationSampler, ComputeLoadGenerator, MemoryLoadGenerator> {
    /// Builds a regulator with real sampler and generators for `host`.
    pub fn for_host(config: &RegulatorConfig, host: &HostProfile) -> Self {
        Self::new(
            config,
            host.confirm_threshold(),
            UtilizationSampler::new(host),
            ComputeLoadGenerator::new(host),
            MemoryLoadGenerator::new(host),
        )
    }
}

impl<S, C, M> RegulatorLoop<S, C, M>
where
    S: UtilizationSource,
    C: LoadGenerator,
    M: LoadGenerator,
{
    pub fn new(
        config: &RegulatorConfig,
        confirm_threshold: u32,
        source: S,
        compute: C,
        memory: M,
    ) -> Self {
        let band = config.hysteresis_band;
        Self {
            source,
            cpu: Channel {
                resource: Resource::Cpu,
                generator: compute,
                hysteresis: Hysteresis::new(
                    f64::from(config.cpu_threshold),
                    band,
                    confirm_threshold,
                ),
            },
            memory: Channel {
                resource: Resource::Memory,
                generator: memory,
                hysteresis: Hysteresis::new(
                    f64::from(config.memory_threshold),
                    band,
                    confirm_threshold,
                ),
            },
            poll_interval: config.poll_interval(),
            workers_enabled: config.enable_workers,
        }
    }

    pub fn compute(&self) -> &C {
        &self.cpu.generator
    }

    pub fn memory(&self) -> &M {
        &self.memory.generator
    }

    /// Samples once and regulates each resource independently.
    pub fn run_cycle(&mut self) -> CycleReport {
        let total_cpu = self.source.cpu_usage();
        let total_mem = self.source.memory_usage();

        let cpu = self.cpu.regulate(total_cpu, self.workers_enabled);
        let memory = self.memory.regulate(total_mem, self.workers_enabled);
        CycleReport {
            cpu,
            memory,
            intensity: u32::try_from(self.cpu.generator.load_level()).unwrap_or(u32::MAX),
            allocated_mb: self.memory.generator.load_level(),
        }
    }

    /// Runs cycles every poll interval until `stop` is set, then stops both generators.
    #[instrument(skip_all, fields(interval_secs = self.poll_interval.as_secs()))]
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(workers_enabled = self.workers_enabled, "regulator started");
        let mut next_cycle = Instant::now();

        while !stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= next_cycle {
                let report = self.run_cycle();
                log_report(&report);
                next_cycle = now + self.poll_interval;
            }
            let remaining = next_cycle.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(TICK));
        }

        self.shutdown();
    }

    /// Stops both generators. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.cpu.generator.stop();
        self.memory.generator.stop();
        info!("regulator stopped");
    }
}

fn log_report(report: &CycleReport) {
    info!(
        cpu = format_args!("{:.1}", report.cpu.total),
        cpu_own = format_args!("{:.1}", report.cpu.own),
        cpu_active = report.cpu.active,
        intensity = report.intensity,
        mem = format_args!("{:.1}", report.memory.total),
        mem_own = format_args!("{:.1}", report.memory.own),
        mem_active = report.memory.active,
        allocated_mb = report.allocated_mb,
        "status"
    );
}
