//! Memory load generator.
//!
//! A single background thread keeps a [`RegionArena`] converging toward a target size.
//! The regulator moves that target in bounded, adaptive steps through
//! [`MemoryLoadGenerator::adjust_load`].

mod arena;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use arena::{MemoryRegion, PAGE_SIZE, RegionArena};

use crate::host::HostProfile;
use crate::shutdown::{STOP_TIMEOUT, join_with_timeout};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

const MIN_CHUNK_SIZE: u64 = 5 * MIB;
const MIN_STEP: u64 = 64 * MIB;
const MIN_ADJUST_PER_CYCLE: u64 = 256 * MIB;
const MAX_ADJUST_PER_CYCLE: u64 = 8 * GIB;
/// Share of total memory the generator may ever target.
const MAX_TARGET_RATIO: f64 = 0.95;

/// Worker threads sleep in slices of this length so `stop()` returns promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Sizing and timing of the memory controller, derived once from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryParams {
    pub total_memory: u64,
    pub chunk_size: u64,
    pub max_adjust_per_cycle: u64,
    pub cooldown: Duration,
    pub period: Duration,
}

impl MemoryParams {
    pub fn new(total_memory: u64, legacy: bool) -> Self {
        Self {
            total_memory,
            chunk_size: optimal_chunk_size(total_memory, legacy),
            max_adjust_per_cycle: max_adjust_per_cycle(total_memory),
            cooldown: Duration::from_secs(1),
            period: Duration::from_secs(1),
        }
    }

    pub fn for_host(host: &HostProfile) -> Self {
        Self::new(host.total_memory(), host.is_legacy())
    }

    /// Highest target the generator will ever converge toward.
    pub fn max_target(&self) -> u64 {
        (self.total_memory as f64 * MAX_TARGET_RATIO) as u64
    }
}

/// Chunk size used when growing the arena. Legacy hosts use half-size chunks.
pub fn optimal_chunk_size(total_memory: u64, legacy: bool) -> u64 {
    let chunk = match total_memory {
        t if t < 16 * GIB => 10 * MIB,
        t if t < 64 * GIB => 20 * MIB,
        t if t < 256 * GIB => 50 * MIB,
        _ => 100 * MIB,
    };
    if legacy {
        (chunk / 2).max(MIN_CHUNK_SIZE)
    } else {
        chunk
    }
}

/// Largest target move per adjustment: 2% of total memory within [256 MiB, 8 GiB].
pub fn max_adjust_per_cycle(total_memory: u64) -> u64 {
    (total_memory / 50).clamp(MIN_ADJUST_PER_CYCLE, MAX_ADJUST_PER_CYCLE)
}

/// Step size for a target that is `off_percent` of total memory away.
fn adaptive_step(off_percent: f64, max_adjust: u64) -> u64 {
    let step = match off_percent {
        p if p > 10.0 => max_adjust,
        p if p > 5.0 => max_adjust / 2,
        p if p > 2.0 => max_adjust / 4,
        _ => max_adjust / 8,
    };
    step.max(MIN_STEP)
}

struct Shared {
    arena: Mutex<RegionArena>,
    target: AtomicU64,
}

struct Worker {
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Holds committed memory and moves it toward a target size.
pub struct MemoryLoadGenerator {
    params: MemoryParams,
    running: AtomicBool,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    last_adjust: Mutex<Instant>,
}

impl MemoryLoadGenerator {
    pub fn new(host: &HostProfile) -> Self {
        Self::with_params(MemoryParams::for_host(host))
    }

    pub fn with_params(params: MemoryParams) -> Self {
        Self {
            params,
            running: AtomicBool::new(false),
            shared: Arc::new(Shared {
                arena: Mutex::new(RegionArena::new()),
                target: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            last_adjust: Mutex::new(Instant::now()),
        }
    }

    pub fn params(&self) -> &MemoryParams {
        &self.params
    }

    pub fn start(&self) {
        self.start_with(|task| {
            thread::Builder::new()
                .name("memory-load".to_owned())
                .spawn(task)
        });
    }

    fn start_with<F>(&self, spawn: F)
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>,
    {
        // Held across the flag flip so a concurrent `stop()` never misses the worker.
        let mut slot = self.worker.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.shared.target.store(0, Ordering::Release);
        *self.last_adjust.lock() = Instant::now();

        let alive = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let params = self.params;
        let worker_alive = Arc::clone(&alive);

        match spawn(Box::new(move || converge_loop(&shared, &params, &worker_alive))) {
            Ok(handle) => {
                *slot = Some(Worker { alive, handle });
                info!(
                    chunk_size_mb = self.params.chunk_size / MIB,
                    max_adjust_mb = self.params.max_adjust_per_cycle / MIB,
                    "memory load started"
                );
            }
            Err(error) => {
                self.running.store(false, Ordering::Release);
                warn!(%error, "failed to spawn memory worker, memory load not started");
            }
        }
    }

    /// Stops the worker and releases every region before returning.
    pub fn stop(&self) {
        let mut slot = self.worker.lock();
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(worker) = slot.take() {
            worker.alive.store(false, Ordering::Release);
            join_with_timeout(vec![worker.handle], STOP_TIMEOUT);
        }

        let released = self.shared.arena.lock().release_all();
        self.shared.target.store(0, Ordering::Release);
        info!(released_mb = released / MIB, "memory load stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Moves the convergence target toward `target_own_usage` percent of total memory.
    ///
    /// The move is bounded by an adaptive step, so large requests converge over several
    /// adjustments. Does nothing while stopped or within the cooldown.
    pub fn adjust_load(&self, current_own_usage: f64, target_own_usage: f64) {
        if !self.is_running() {
            return;
        }

        let mut last_adjust = self.last_adjust.lock();
        if last_adjust.elapsed() < self.params.cooldown {
            return;
        }
        *last_adjust = Instant::now();

        let total = self.params.total_memory;
        let max_target = self.params.max_target();
        let requested =
            ((total as f64 * target_own_usage.max(0.0) / 100.0) as u64).min(max_target);
        let allocated = self.allocated_size();

        let gap = requested.abs_diff(allocated);
        let off_percent = gap as f64 / total as f64 * 100.0;
        let step = adaptive_step(off_percent, self.params.max_adjust_per_cycle).min(gap);
        let next = if requested >= allocated {
            allocated.saturating_add(step).min(max_target)
        } else {
            allocated.saturating_sub(step)
        };

        self.shared.target.store(next, Ordering::Release);
        debug!(
            current_own_usage,
            target_own_usage,
            allocated_mb = allocated / MIB,
            target_mb = next / MIB,
            "memory target adjusted"
        );
    }

    /// Bytes currently committed, re-queried from the allocator for every region.
    pub fn allocated_size(&self) -> u64 {
        self.shared.arena.lock().committed_size()
    }

    /// Committed memory in whole MiB.
    pub fn allocated_mb(&self) -> u64 {
        self.allocated_size() / MIB
    }

    /// Size the background thread is currently converging toward.
    pub fn target_size(&self) -> u64 {
        self.shared.target.load(Ordering::Acquire)
    }

    pub fn region_count(&self) -> usize {
        self.shared.arena.lock().len()
    }

    /// This generator's own share of total memory, in percent.
    pub fn usage(&self) -> f64 {
        if !self.is_running() || self.params.total_memory == 0 {
            return 0.0;
        }
        let usage = self.allocated_size() as f64 / self.params.total_memory as f64 * 100.0;
        usage.min(100.0)
    }
}

impl Drop for MemoryLoadGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn converge_loop(shared: &Shared, params: &MemoryParams, alive: &AtomicBool) {
    while alive.load(Ordering::Acquire) {
        converge_once(shared, params, alive);
        sleep_while_alive(params.period, alive);
    }
}

fn converge_once(shared: &Shared, params: &MemoryParams, alive: &AtomicBool) {
    let target = shared.target.load(Ordering::Acquire);
    let mut arena = shared.arena.lock();
    let current = arena.committed_size();

    if target > current {
        let committed = arena.grow_to(target, params.chunk_size, || {
            alive.load(Ordering::Relaxed)
        });
        if current + committed < target && alive.load(Ordering::Relaxed) {
            debug!(
                target_mb = target / MIB,
                reached_mb = (current + committed) / MIB,
                "memory growth halted, retrying next cycle"
            );
        }
    } else if target < current {
        let released = arena.shrink_to(target);
        if released > 0 {
            debug!(released_mb = released / MIB, "memory released");
        }
    }
}

fn sleep_while_alive(period: Duration, alive: &AtomicBool) {
    let deadline = Instant::now() + period;
    while alive.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(SLEEP_SLICE));
    }
}
