//! Named sources and compose functions.
//!
//! Contracts refer to loaders and compose functions by name. A [`Registry`]
//! maps those names to trait objects; it is populated explicitly at start-up
//! and handed to the pipeline through its context.
//!
//! ```
//! use ironseries::record::RecordStream;
//! use ironseries::registry::Registry;
//! use ironseries::testing::hourly_records;
//!
//! let mut reg = Registry::with_builtins();
//! reg.register_source("fixed", |_: &serde_json::Value| -> anyhow::Result<RecordStream> {
//!     Ok(hourly_records(0, &[1.0, 2.0]))
//! });
//! assert!(reg.source("fixed").is_ok());
//! assert!(reg.compose("nope").is_err());
//! ```

use crate::compose::{self, ComposeFn};
use crate::error::EngineError;
use crate::record::RecordStream;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opens a fresh record stream from loader parameters.
pub trait SourceFactory: Send + Sync {
    /// # Errors
    /// Invalid parameters or an unreachable source.
    fn open(&self, params: &serde_json::Value) -> Result<RecordStream>;
}

impl<F> SourceFactory for F
where
    F: Fn(&serde_json::Value) -> Result<RecordStream> + Send + Sync,
{
    fn open(&self, params: &serde_json::Value) -> Result<RecordStream> {
        self(params)
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    sources: BTreeMap<String, Arc<dyn SourceFactory>>,
    composers: BTreeMap<String, Arc<dyn ComposeFn>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `synthetic` plus the `sum`, `mean` and `difference` compose functions.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_source("synthetic", crate::synthetic::open_synthetic);
        reg.register_compose_arc("sum", compose::sum());
        reg.register_compose_arc("mean", compose::mean());
        reg.register_compose_arc("difference", compose::difference());
        reg
    }

    /// Register (or replace) a loader.
    pub fn register_source(&mut self, name: impl Into<String>, factory: impl SourceFactory + 'static) -> &mut Self {
        self.sources.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_compose(&mut self, name: impl Into<String>, f: impl ComposeFn + 'static) -> &mut Self {
        self.register_compose_arc(name, Arc::new(f))
    }

    pub fn register_compose_arc(&mut self, name: impl Into<String>, f: Arc<dyn ComposeFn>) -> &mut Self {
        self.composers.insert(name.into(), f);
        self
    }

    /// # Errors
    /// Unknown loader name.
    pub fn source(&self, name: &str) -> Result<Arc<dyn SourceFactory>> {
        self.sources.get(name).cloned().ok_or_else(|| {
            EngineError::config("source.loader", format!("unknown loader `{name}`; registered: {:?}", self.sources.keys().collect::<Vec<_>>())).into()
        })
    }

    /// # Errors
    /// Unknown compose function name.
    pub fn compose(&self, name: &str) -> Result<Arc<dyn ComposeFn>> {
        self.composers.get(name).cloned().ok_or_else(|| {
            EngineError::config("compose.function", format!("unknown compose function `{name}`")).into()
        })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("composers", &self.composers.keys().collect::<Vec<_>>())
            .finish()
    }
}
