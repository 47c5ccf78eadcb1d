//! Testing utilities for stream and vector pipelines.
//!
//! - **Builders**: [`RecordBuilder`] and [`hourly_records`] for record streams.
//! - **Fixtures**: [`CountingSource`], a loader that counts opens and pulls,
//!   and [`hourly_project`], a small end-to-end project.
//! - **Assertions**: [`collect_ok`] and [`assert_non_decreasing`].
//!
//! ```
//! use ironseries::testing::*;
//!
//! let recs = collect_ok(hourly_records(0, &[1.0, 2.0, 3.0]))?;
//! assert_non_decreasing(&recs, |r| r.time);
//! # anyhow::Ok(())
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;

pub use assertions::*;
pub use builders::*;
pub use fixtures::*;
