//! Exact median combiner.

use super::CombineFn;
use ordered_float::OrderedFloat;

/* ===================== Median ===================== */

/// Exact median of finite values; the mean of the two middle values for even counts.
///
/// Windows reduced here are bounded by configuration (`window`, group sizes), so
/// the accumulator keeps every value rather than a sketch.
#[derive(Clone, Copy, Debug, Default)]
pub struct Median;

impl CombineFn<f64, Vec<OrderedFloat<f64>>, Option<f64>> for Median {
    fn create(&self) -> Vec<OrderedFloat<f64>> {
        Vec::new()
    }

    fn add_input(&self, acc: &mut Vec<OrderedFloat<f64>>, v: f64) {
        if v.is_finite() {
            acc.push(OrderedFloat(v));
        }
    }

    fn finish(&self, mut acc: Vec<OrderedFloat<f64>>) -> Option<f64> {
        if acc.is_empty() {
            return None;
        }
        acc.sort_unstable();
        let mid = acc.len() / 2;
        if acc.len() % 2 == 1 {
            Some(acc[mid].0)
        } else {
            Some(f64::midpoint(acc[mid - 1].0, acc[mid].0))
        }
    }
}
