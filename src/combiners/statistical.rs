//! Statistical combiners: `Mean` and the `RunningStats` accumulator

use super::CombineFn;
use serde::{Deserialize, Serialize};

/* ===================== RunningStats ===================== */

/// Welford running mean / variance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl RunningStats {
    #[must_use]
    pub const fn new() -> Self {
        Self { count: 0, mean: 0.0, m2: 0.0 }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Population variance; 0 for fewer than two observations.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.count < 2 { 0.0 } else { self.m2 / self.count as f64 }
    }

    #[must_use]
    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }
}

/* ===================== Mean ===================== */

/// Arithmetic mean of finite values. Empty input produces `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mean;

impl CombineFn<f64, RunningStats, Option<f64>> for Mean {
    fn create(&self) -> RunningStats {
        RunningStats::new()
    }

    fn add_input(&self, acc: &mut RunningStats, v: f64) {
        acc.push(v);
    }

    fn finish(&self, acc: RunningStats) -> Option<f64> {
        (acc.count > 0).then_some(acc.mean)
    }
}
