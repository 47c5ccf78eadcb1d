//! Sample sinks.
//!
//! Sinks consume a [`SampleStream`](crate::sample::SampleStream) and return the
//! number of samples written. The first stream error aborts the write and is
//! returned as is, so callers can still match on its
//! [`EngineError`](crate::error::EngineError).

#[cfg_attr(docsrs, doc(cfg(feature = "io-jsonl")))]
#[cfg(feature = "io-jsonl")]
pub mod jsonl;

#[cfg_attr(docsrs, doc(cfg(feature = "io-csv")))]
#[cfg(feature = "io-csv")]
pub mod csv;

use anyhow::{Context, Result};
use std::fs::create_dir_all;
use std::path::Path;

/// `mkdir -p` the parent of `path`.
pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    Ok(())
}
