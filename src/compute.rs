use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::host::HostProfile;
use crate::shutdown::{STOP_TIMEOUT, join_with_timeout};

/// Length of one work/sleep duty cycle. Intensity is the busy share in milliseconds.
const DUTY_PERIOD: Duration = Duration::from_millis(100);
const INITIAL_INTENSITY: u32 = 30;
const MAX_INTENSITY: u32 = 100;

/// Adjustment cooldown for a pool of `processors` workers. More workers react faster.
pub fn cooldown_for(processors: usize) -> Duration {
    match processors {
        n if n >= 16 => Duration::from_millis(300),
        n if n >= 8 => Duration::from_millis(400),
        _ => Duration::from_millis(500),
    }
}

/// Fixed intensity step for a usage error of `diff` percentage points.
pub fn intensity_step(diff: f64) -> i32 {
    let magnitude = match diff.abs() {
        d if d > 20.0 => 8,
        d if d > 10.0 => 5,
        d if d > 5.0 => 3,
        d if d > 2.0 => 2,
        d if d > 0.5 => 1,
        _ => 0,
    };
    if diff < 0.0 { -magnitude } else { magnitude }
}

struct WorkerPool {
    alive: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// Burns CPU on one thread per logical processor at a controllable intensity.
///
/// Each worker spends `intensity` ms of every 100 ms period on arithmetic and sleeps
/// for the rest. The intensity is read once per period, so adjustments take effect
/// within one period.
pub struct ComputeLoadGenerator {
    running: AtomicBool,
    intensity: Arc<AtomicU32>,
    pool: Mutex<Option<WorkerPool>>,
    last_adjust: Mutex<Instant>,
    worker_count: usize,
    cooldown: Duration,
}

impl ComputeLoadGenerator {
    pub fn new(host: &HostProfile) -> Self {
        let processors = host.logical_processors();
        Self::with_params(processors, cooldown_for(processors))
    }

    pub fn with_params(worker_count: usize, cooldown: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            intensity: Arc::new(AtomicU32::new(0)),
            pool: Mutex::new(None),
            last_adjust: Mutex::new(Instant::now()),
            worker_count,
            cooldown,
        }
    }

    /// Spawns the worker pool at the initial intensity. Does nothing if already running.
    pub fn start(&self) {
        // The pool slot is held across the flag flip so a concurrent `stop()` either sees
        // the installed pool or waits for it.
        let mut slot = self.pool.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.intensity.store(INITIAL_INTENSITY, Ordering::Release);
        *self.last_adjust.lock() = Instant::now();

        let alive = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(self.worker_count);
        for id in 0..self.worker_count {
            let alive = Arc::clone(&alive);
            let intensity = Arc::clone(&self.intensity);
            let spawned = thread::Builder::new()
                .name(format!("compute-load-{id}"))
                .spawn(move || duty_cycle(&alive, &intensity));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(error) => warn!(worker = id, %error, "failed to spawn compute worker"),
            }
        }

        info!(
            workers = handles.len(),
            intensity = INITIAL_INTENSITY,
            "compute load started"
        );
        *slot = Some(WorkerPool { alive, handles });
    }

    /// Signals every worker to exit and waits for them, bounded by [`STOP_TIMEOUT`].
    pub fn stop(&self) {
        let mut slot = self.pool.lock();
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(pool) = slot.take() {
            pool.alive.store(false, Ordering::Release);
            join_with_timeout(pool.handles, STOP_TIMEOUT);
        }
        self.intensity.store(0, Ordering::Release);
        info!("compute load stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Nudges intensity one tabulated step toward `target_own_usage`.
    ///
    /// Does nothing while stopped or within the cooldown of the previous adjustment.
    pub fn adjust_load(&self, current_own_usage: f64, target_own_usage: f64) {
        if !self.is_running() {
            return;
        }

        let mut last_adjust = self.last_adjust.lock();
        if last_adjust.elapsed() < self.cooldown {
            return;
        }
        *last_adjust = Instant::now();

        let step = intensity_step(target_own_usage - current_own_usage);
        if step == 0 {
            return;
        }
        let current = self.intensity.load(Ordering::Acquire) as i32;
        let next = (current + step).clamp(0, MAX_INTENSITY as i32) as u32;
        self.intensity.store(next, Ordering::Release);
        debug!(
            current_own_usage,
            target_own_usage, from = current, to = next, "compute intensity adjusted"
        );
    }

    pub fn intensity(&self) -> u32 {
        self.intensity.load(Ordering::Acquire)
    }

    /// This generator's own share of total CPU, estimated as its intensity.
    pub fn usage(&self) -> f64 {
        if !self.is_running() {
            return 0.0;
        }
        f64::from(self.intensity().min(MAX_INTENSITY))
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl Drop for ComputeLoadGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn duty_cycle(alive: &AtomicBool, intensity: &AtomicU32) {
    while alive.load(Ordering::Acquire) {
        let level = intensity.load(Ordering::Acquire).min(MAX_INTENSITY);
        let busy = Duration::from_millis(u64::from(level));

        let started = Instant::now();
        while started.elapsed() < busy && alive.load(Ordering::Relaxed) {
            black_box(burn(level));
        }

        let idle = DUTY_PERIOD.saturating_sub(busy);
        if !idle.is_zero() && alive.load(Ordering::Relaxed) {
            thread::sleep(idle);
        }
    }
}

/// One unit of CPU-bound work. Higher levels run proportionally more iterations.
fn burn(level: u32) -> f64 {
    let iterations = 100 + level * 10;
    let mut acc = 0.0f64;

    for i in 0..iterations {
        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
        acc += sign / (2.0 * f64::from(i) + 1.0);
    }
    let pi = black_box(acc * 4.0);

    for i in 0..iterations {
        let angle = f64::from(i) * 0.1;
        acc += angle.sin() * angle.cos() * angle.tan();
    }

    let mut matrix = [[0.0f64; 10]; 10];
    for (i, row) in matrix.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (i * j) as f64 * ((i + j) as f64).sin();
        }
    }
    black_box(&matrix);

    for i in 1..iterations {
        let x = f64::from(i);
        acc += x.ln() * f64::from(i % 10).exp();
        acc += x.sqrt() * x.powf(1.5);
    }

    black_box(acc + pi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(cooldown_ms: u64) -> ComputeLoadGenerator {
        ComputeLoadGenerator::with_params(1, Duration::from_millis(cooldown_ms))
    }

    #[test]
    fn test_step_table() {
        let cases = [
            (25.0, 8),
            (20.5, 8),
            (20.0, 5),
            (15.0, 5),
            (7.0, 3),
            (3.0, 2),
            (1.0, 1),
            (0.5, 0),
            (0.0, 0),
            (-0.4, 0),
            (-1.0, -1),
            (-4.0, -2),
            (-6.0, -3),
            (-12.0, -5),
            (-30.0, -8),
        ];
        for (diff, step) in cases {
            assert_eq!(intensity_step(diff), step, "diff {diff}");
        }
    }

    #[test]
    fn test_cooldown_scales_with_processors() {
        assert_eq!(cooldown_for(32), Duration::from_millis(300));
        assert_eq!(cooldown_for(16), Duration::from_millis(300));
        assert_eq!(cooldown_for(8), Duration::from_millis(400));
        assert_eq!(cooldown_for(4), Duration::from_millis(500));
        assert_eq!(cooldown_for(1), Duration::from_millis(500));
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let g = generator(50);
        assert!(!g.is_running());
        assert_eq!(g.usage(), 0.0);

        g.start();
        assert!(g.is_running());
        assert_eq!(g.intensity(), INITIAL_INTENSITY);
        assert_eq!(g.usage(), f64::from(INITIAL_INTENSITY));

        g.start();
        assert_eq!(g.pool.lock().as_ref().map(|p| p.handles.len()), Some(1));

        g.stop();
        assert!(!g.is_running());
        assert_eq!(g.intensity(), 0);
        assert_eq!(g.usage(), 0.0);
        assert!(g.pool.lock().is_none());

        g.stop();
        assert!(!g.is_running());
    }

    #[test]
    fn test_concurrent_start_and_stop_leave_no_workers() {
        let g = Arc::new(ComputeLoadGenerator::with_params(16, Duration::from_millis(50)));

        let starter = {
            let g = Arc::clone(&g);
            thread::spawn(move || {
                for _ in 0..20 {
                    g.start();
                }
            })
        };
        let stopper = {
            let g = Arc::clone(&g);
            thread::spawn(move || {
                for _ in 0..20 {
                    let spin = Instant::now();
                    while !g.is_running() && spin.elapsed() < Duration::from_millis(20) {
                        thread::yield_now();
                    }
                    g.stop();
                }
            })
        };
        starter.join().unwrap();
        stopper.join().unwrap();

        let pool_present = g.pool.lock().is_some();
        assert_eq!(g.is_running(), pool_present);

        g.stop();
        assert!(!g.is_running());
        assert!(g.pool.lock().is_none());
        assert_eq!(g.intensity(), 0);
        // Every worker holds a clone of the intensity cell until it exits.
        assert_eq!(Arc::strong_count(&g.intensity), 1);
    }

    #[test]
    fn test_adjust_is_noop_when_stopped() {
        let g = generator(0);
        g.adjust_load(0.0, 100.0);
        assert_eq!(g.intensity(), 0);
    }

    #[test]
    fn test_single_step_after_cooldown() {
        let g = generator(50);
        g.start();
        thread::sleep(Duration::from_millis(70));
        g.adjust_load(30.0, 55.0);
        assert_eq!(g.intensity(), 38);
        g.stop();
    }

    #[test]
    fn test_adjust_within_cooldown_is_ignored() {
        let g = generator(10_000);
        g.start();
        for _ in 0..5 {
            g.adjust_load(0.0, 100.0);
        }
        assert_eq!(g.intensity(), INITIAL_INTENSITY);
        g.stop();
    }

    #[test]
    fn test_decrease_moves_down() {
        let g = generator(20);
        g.start();
        thread::sleep(Duration::from_millis(40));
        g.adjust_load(30.0, 18.0);
        assert_eq!(g.intensity(), 25);
        g.stop();
    }

    #[test]
    fn test_intensity_is_clamped() {
        let g = generator(5);
        g.start();
        for _ in 0..12 {
            thread::sleep(Duration::from_millis(10));
            g.adjust_load(0.0, 100.0);
            assert!(g.intensity() <= MAX_INTENSITY);
        }
        assert_eq!(g.intensity(), MAX_INTENSITY);

        for _ in 0..20 {
            thread::sleep(Duration::from_millis(10));
            g.adjust_load(100.0, 0.0);
        }
        assert_eq!(g.intensity(), 0);
        g.stop();
    }

    #[test]
    fn test_burn_scales_with_level() {
        let low = Instant::now();
        for _ in 0..50 {
            black_box(burn(0));
        }
        let low = low.elapsed();
        let high = Instant::now();
        for _ in 0..50 {
            black_box(burn(100));
        }
        assert!(high.elapsed() > low);
    }
}
