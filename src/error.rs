//! Error taxonomy for the engine.
//!
//! Fallible operations return [`anyhow::Result`]; fatal conditions carry an
//! [`EngineError`] as their root cause so callers can branch on the category:
//!
//! ```
//! use ironseries::error::EngineError;
//!
//! let err: anyhow::Error = EngineError::config("dataset.group_by", "bad cadence").into();
//! match err.downcast_ref::<EngineError>() {
//!     Some(EngineError::Config { path, .. }) => assert_eq!(path, "dataset.group_by"),
//!     _ => unreachable!(),
//! }
//! ```
//!
//! Drop-level problems (a record rejected by a filter, a sample removed by a
//! postprocess transform) are not errors; they are counted in
//! [`RunMetrics`](crate::metrics::RunMetrics).

use thiserror::Error;

/// Fatal engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Invalid or unresolvable configuration. Never partially applied.
    #[error("configuration error at `{path}`: {message}")]
    Config { path: String, message: String },

    /// A stage received input that breaks the `(partition, time)` ordering it relies on.
    #[error("ordering violation in {stage}: {detail}")]
    Ordering { stage: &'static str, detail: String },

    /// Spool serialization, disk or file-lock failures.
    #[error("resource error: {0}")]
    Resource(String),

    /// A derived artifact (schema, scaler statistics, metadata) has not been built.
    #[error("artifact `{0}` is not available; run the build step first")]
    MissingArtifact(String),

    /// Another writer currently holds the build lock for this artifact.
    #[error("a build of artifact `{0}` is already in progress")]
    BuildInProgress(String),

    /// The run-level cancellation token fired.
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn ordering(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::Ordering {
            stage,
            detail: detail.into(),
        }
    }
}

/// Return the [`EngineError`] at the root of an `anyhow` chain, if any.
#[must_use]
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain().find_map(|e| e.downcast_ref::<EngineError>())
}
