//! Exponentially smoothed per-unit cost tracking.
//!
//! Feeds two controller decisions: the adaptive cooldown between epochs
//! and the mission cost stop gate. Projections wear a conservatism
//! factor that shrinks as the sample count grows.

/// Smoothing factor for the moving average.
const ALPHA: f64 = 0.30;

/// Samples above `OUTLIER_FACTOR * ema` are dampened.
const OUTLIER_FACTOR: f64 = 3.0;

/// Dampened samples are clamped to `CLAMP_FACTOR * ema`.
const CLAMP_FACTOR: f64 = 2.0;

/// Minimum samples before outlier dampening kicks in.
const OUTLIER_MIN_SAMPLES: usize = 3;

/// EMA cost tracker with outlier dampening and conservative projection.
#[derive(Debug, Clone, Default)]
pub struct EmaBudget {
    ema: f64,
    samples: usize,
}

impl EmaBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a per-unit cost sample.
    ///
    /// With at least [`OUTLIER_MIN_SAMPLES`] samples, a cost above
    /// `3 * ema` is clamped to `2 * ema` before it enters the average, so
    /// one runaway worker does not wreck the projection.
    pub fn record(&mut self, cost: f64) {
        let cost = cost.max(0.0);
        let effective = if self.samples >= OUTLIER_MIN_SAMPLES && cost > OUTLIER_FACTOR * self.ema {
            CLAMP_FACTOR * self.ema
        } else {
            cost
        };

        if self.samples == 0 {
            self.ema = effective;
        } else {
            self.ema = ALPHA * effective + (1.0 - ALPHA) * self.ema;
        }
        self.samples += 1;
    }

    /// Current smoothed per-unit cost.
    pub fn ema(&self) -> f64 {
        self.ema
    }

    /// Number of samples recorded.
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Conservatism factor `k(n) = 1 + 0.5 / sqrt(n)`.
    ///
    /// With no samples the projection is maximally padded.
    pub fn conservatism(&self) -> f64 {
        if self.samples == 0 {
            1.5
        } else {
            1.0 + 0.5 / (self.samples as f64).sqrt()
        }
    }

    /// Projected cost of finishing `remaining_units` more units.
    pub fn projected_total(&self, remaining_units: usize) -> f64 {
        self.ema * remaining_units as f64 * self.conservatism()
    }

    /// Whether spending should slow down: projecting the remaining work on
    /// top of what is already spent meets or exceeds the budget.
    pub fn should_slow_down(&self, spent: f64, budget: f64, remaining_units: usize) -> bool {
        self.projected_total(remaining_units) + spent >= budget
    }

    /// Scale a base cooldown by budget pressure.
    ///
    /// Returns the base value when there is headroom, doubled when the
    /// projection says to slow down.
    pub fn cooldown_secs(&self, base: u64, spent: f64, budget: f64, remaining_units: usize) -> u64 {
        if self.should_slow_down(spent, budget, remaining_units) {
            base.saturating_mul(2)
        } else {
            base
        }
    }
}
