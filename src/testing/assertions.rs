//! Assertions over record and sample streams.

use anyhow::Result;
use std::fmt::Debug;

/// Collect a fallible stream, failing on its first error.
///
/// # Errors
/// The first error the stream yields.
pub fn collect_ok<T, I>(stream: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = Result<T>>,
{
    stream.into_iter().collect()
}

/// Assert that `key` never decreases across `items`.
///
/// # Panics
///
/// Panics at the first decreasing pair, naming its index.
pub fn assert_non_decreasing<T, K, F>(items: &[T], key: F)
where
    T: Debug,
    K: PartialOrd + Debug,
    F: Fn(&T) -> K,
{
    for (i, pair) in items.windows(2).enumerate() {
        let (a, b) = (key(&pair[0]), key(&pair[1]));
        assert!(a <= b, "key decreases at index {}: {a:?} > {b:?}\n  items: {:?} / {:?}", i + 1, pair[0], pair[1]);
    }
}
