//! Reducers shared by aggregation, rolling fills and postprocess fills.
//!
//! Every reducer implements [`CombineFn`], the same create / add / finish
//! protocol used for per-key combining:
//!
//! - [`First`] / [`Last`] -- positional picks.
//! - [`Mean`] -- arithmetic mean over [`RunningStats`] (Welford).
//! - [`Median`] -- exact median.
//!
//! [`Statistic`] is the configuration-facing selector that dispatches to them.
//!
//! # Examples
//! ```
//! use ironseries::combiners::Statistic;
//!
//! assert_eq!(Statistic::Mean.reduce([1.0, 2.0, 6.0]), Some(3.0));
//! assert_eq!(Statistic::Median.reduce([5.0, 1.0, 3.0, 100.0]), Some(4.0));
//! assert_eq!(Statistic::Last.reduce(Vec::<f64>::new()), None);
//! ```

mod basic;
mod quantiles;
mod statistical;

pub use basic::{First, Last};
pub use quantiles::Median;
pub use statistical::{Mean, RunningStats};

use serde::{Deserialize, Serialize};

/// Incremental reducer from values `V` through an accumulator `A` to an output `O`.
pub trait CombineFn<V, A, O>: Send + Sync + 'static {
    fn create(&self) -> A;
    fn add_input(&self, acc: &mut A, v: V);
    fn finish(&self, acc: A) -> O;
}

/// Run a combiner over a whole iterator.
pub fn combine_all<V, A, O, C>(comb: &C, values: impl IntoIterator<Item = V>) -> O
where
    C: CombineFn<V, A, O>,
{
    let mut acc = comb.create();
    for v in values {
        comb.add_input(&mut acc, v);
    }
    comb.finish(acc)
}

/// Named reduction, as written in configuration (`first`, `last`, `mean`, `median`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    First,
    #[default]
    Last,
    Mean,
    Median,
}

impl Statistic {
    /// Reduce numeric values; `None` when there is nothing to reduce.
    #[must_use]
    pub fn reduce(self, values: impl IntoIterator<Item = f64>) -> Option<f64> {
        match self {
            Self::First => combine_all(&First, values),
            Self::Last => combine_all(&Last, values),
            Self::Mean => combine_all(&Mean, values),
            Self::Median => combine_all(&Median, values),
        }
    }
}
