//! # Ironseries
//!
//! A **deterministic stream assembly and vector engine** for building
//! model-ready time-series datasets. Raw temporal records from any number of
//! sources are ordered, regularized per partition, optionally composed into
//! derived streams, projected into per-feature events, and assembled into one
//! [`Sample`] per time bucket. Samples are then normalized against a schema,
//! post-processed, and split into labelled subsets.
//!
//! ## Key Features
//!
//! - **Bounded memory** - external sort with spill runs, spooled fan-out buffers
//! - **Determinism** - the same inputs and configuration yield byte-identical samples,
//!   in sequential and parallel mode alike
//! - **Single-pass fan-out** - a stream read by many features is opened once
//! - **Typed configuration** - tagged serde enums, validated before anything runs
//! - **Fingerprinted artifacts** - schema, metadata and scaler statistics are rebuilt
//!   only when the configuration they depend on changes
//!
//! ## Quick Start
//!
//! ```
//! use ironseries::prelude::*;
//!
//! let dir = tempfile::tempdir()?;
//! let cfg = ironseries::testing::hourly_project(99)?;
//! let ctx = PipelineContext::new(Registry::with_builtins(), ArtifactStore::new(dir.path()));
//! build_artifacts(&cfg, &ctx, false)?;
//!
//! let samples = VectorPipeline::new(&cfg, &ctx)?.samples()?.collect::<anyhow::Result<Vec<_>>>()?;
//! assert_eq!(samples.len(), 100);
//! assert!(samples.iter().all(|s| s.split.is_some()));
//! # anyhow::Ok(())
//! ```
//!
//! ## Architecture
//!
//! 1. [`ordering`] - the ordered emitter, sorting each source by `(partition, time)`
//! 2. [`filters`], [`engine`], [`lint`] - record, stream and debug rules of a contract
//! 3. [`fanout`] - shared streams read by several consumers
//! 4. [`compose`] - aligns streams and derives new ones
//! 5. [`feature`] - feature ids, scaling and sequence windows
//! 6. [`assembler`] - one sample per bucket
//! 7. [`postprocess`] - schema normalization and vector transforms
//! 8. [`split`] - deterministic labels
//! 9. [`build`], [`artifacts`] - fingerprinted artifacts and the build cache
//!
//! [`pipeline`] wires these together; [`config`] describes a project;
//! [`registry`] resolves loader and compose-function names.

pub mod artifacts;
pub mod assembler;
pub mod build;
pub mod combiners;
pub mod compose;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod feature;
pub mod filters;
pub mod io;
pub mod lint;
pub mod metrics;
pub mod ordering;
pub mod pipeline;
pub mod postprocess;
pub mod record;
pub mod registry;
pub mod runner;
pub mod sample;
pub mod split;
pub mod spool;
pub mod synthetic;
pub mod testing;
pub mod window;

pub use artifacts::ArtifactStore;
pub use build::{BuildOutcome, build_artifacts};
pub use config::ProjectConfig;
pub use error::EngineError;
pub use metrics::{Counter, RunMetrics};
pub use pipeline::{PipelineContext, VectorPipeline};
pub use record::{TemporalRecord, Value};
pub use registry::Registry;
pub use runner::{CancellationToken, ExecMode};
pub use sample::{FeatureValue, Sample};
pub use window::{Cadence, TimestampMs, Window};

#[cfg(feature = "io-jsonl")]
pub use io::jsonl::{read_samples_jsonl, write_samples_jsonl};

#[cfg(feature = "io-csv")]
pub use io::csv::write_samples_csv;

/// The types most programs need.
pub mod prelude {
    pub use crate::artifacts::ArtifactStore;
    pub use crate::build::{BuildOutcome, build_artifacts};
    pub use crate::config::ProjectConfig;
    pub use crate::error::EngineError;
    pub use crate::pipeline::{PipelineContext, VectorPipeline};
    pub use crate::record::{TemporalRecord, Value};
    pub use crate::registry::Registry;
    pub use crate::runner::{CancellationToken, ExecMode};
    pub use crate::sample::{FeatureValue, Sample};
}
