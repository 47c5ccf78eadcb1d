//! Positional picks over numeric values.

use super::CombineFn;

/// Earliest finite value in arrival order.
#[derive(Clone, Copy, Debug, Default)]
pub struct First;

impl CombineFn<f64, Option<f64>, Option<f64>> for First {
    fn create(&self) -> Option<f64> {
        None
    }

    fn add_input(&self, acc: &mut Option<f64>, v: f64) {
        if v.is_finite() {
            acc.get_or_insert(v);
        }
    }

    fn finish(&self, acc: Option<f64>) -> Option<f64> {
        acc
    }
}

/// Latest finite value in arrival order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Last;

impl CombineFn<f64, Option<f64>, Option<f64>> for Last {
    fn create(&self) -> Option<f64> {
        None
    }

    fn add_input(&self, acc: &mut Option<f64>, v: f64) {
        if v.is_finite() {
            *acc = Some(v);
        }
    }

    fn finish(&self, acc: Option<f64>) -> Option<f64> {
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiners::combine_all;

    #[test]
    fn picks_skip_non_finite() {
        let vals = [f64::NAN, 2.0, 3.0, f64::INFINITY];
        assert_eq!(combine_all(&First, vals), Some(2.0));
        assert_eq!(combine_all(&Last, vals), Some(3.0));
    }

    #[test]
    fn empty_input_picks_nothing() {
        assert_eq!(combine_all(&First, [f64::NAN]), None);
        assert_eq!(combine_all(&Last, Vec::<f64>::new()), None);
    }
}
