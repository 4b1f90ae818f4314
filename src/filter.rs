/// Exponential moving average used to damp noisy utilization samples.
///
/// Lower `alpha` favors stability over responsiveness.
#[derive(Debug, Clone)]
pub struct SmoothingFilter {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl SmoothingFilter {
    /// Creates an uninitialized filter. `alpha` is clamped to `0.0..=1.0`.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_nan() { 0.0 } else { alpha.clamp(0.0, 1.0) };
        Self {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Feeds a new sample and returns the smoothed value.
    ///
    /// The first sample after construction or [`reset`](Self::reset) is returned as-is.
    pub fn update(&mut self, sample: f64) -> f64 {
        if self.initialized {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        } else {
            self.value = sample;
            self.initialized = true;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Changes the smoothing coefficient; values outside `0.0..=1.0` are ignored.
    pub fn set_alpha(&mut self, alpha: f64) {
        if (0.0..=1.0).contains(&alpha) {
            self.alpha = alpha;
        }
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}

impl Default for SmoothingFilter {
    fn default() -> Self {
        Self::new(0.3)
    }
}
