use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

/// Bounded wait applied when a generator stops its worker threads.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Joins `handles`, giving up on any thread still running once `timeout` elapses.
///
/// Threads that miss the deadline are detached. Returns how many were detached.
pub(crate) fn join_with_timeout(handles: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut pending = handles;

    while !pending.is_empty() && Instant::now() < deadline {
        let (finished, still_running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|h| h.is_finished());
        for handle in finished {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!(thread = ?name, "worker thread panicked");
            }
        }
        pending = still_running;
        if !pending.is_empty() {
            thread::sleep(JOIN_POLL_INTERVAL);
        }
    }

    let detached = pending.len();
    if detached > 0 {
        warn!(
            detached,
            timeout_ms = timeout.as_millis() as u64,
            "worker threads did not exit in time, detaching"
        );
    }
    detached
}
