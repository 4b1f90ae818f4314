/// Anti-flapping on/off decision for one load generator.
///
/// An active generator stays active while other usage is below `threshold + band`; an
/// inactive one activates only once other usage drops below `threshold - band`. A change
/// is committed after `confirm_threshold` consecutive cycles agree on it.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    threshold: f64,
    band: f64,
    confirm_threshold: u32,
    active: bool,
    start_count: u32,
    stop_count: u32,
}

/// Outcome of one [`Hysteresis::observe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Activated,
    Deactivated,
}

impl Hysteresis {
    pub fn new(threshold: f64, band: f64, confirm_threshold: u32) -> Self {
        Self {
            threshold,
            band: band.abs(),
            confirm_threshold: confirm_threshold.max(1),
            active: false,
            start_count: 0,
            stop_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether `other_usage` argues for the generator running, given the current state.
    pub fn wants_active(&self, other_usage: f64) -> bool {
        if self.active {
            other_usage < self.threshold + self.band
        } else {
            other_usage < self.threshold - self.band
        }
    }

    /// Feeds one cycle's other-process usage and commits a transition once confirmed.
    pub fn observe(&mut self, other_usage: f64) -> Transition {
        let wants_active = self.wants_active(other_usage);
        if wants_active == self.active {
            self.start_count = 0;
            self.stop_count = 0;
            return Transition::Unchanged;
        }

        if wants_active {
            self.start_count += 1;
            self.stop_count = 0;
            if self.start_count >= self.confirm_threshold {
                self.active = true;
                self.start_count = 0;
                return Transition::Activated;
            }
        } else {
            self.stop_count += 1;
            self.start_count = 0;
            if self.stop_count >= self.confirm_threshold {
                self.active = false;
                self.stop_count = 0;
                return Transition::Deactivated;
            }
        }
        Transition::Unchanged
    }
}
