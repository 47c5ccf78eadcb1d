//! Pipeline construction: from a validated [`ProjectConfig`] to a lazy
//! [`SampleStream`].
//!
//! ```text
//! source ─ record rules ─ ordered emitter ─ stream rules ─ debug rules ─┐
//!                                                            SharedStream (fan-out)
//!        ┌───────────────────────────────────────────────────┬──────────┘
//!   Aligner (composed streams)                     FeatureProjector per feature/target
//!                                                            │ (worker thread in parallel mode)
//!                                               VectorAssembler ─ Postprocessor ─ Splitter
//! ```
//!
//! Every canonical stream that anything reads is opened at most once; each
//! consumer gets its own [`TeeReader`](crate::fanout::TeeReader). Nothing is
//! pulled until the returned stream is.
//!
//! ```
//! use ironseries::artifacts::ArtifactStore;
//! use ironseries::config::ProjectConfig;
//! use ironseries::pipeline::{PipelineContext, VectorPipeline};
//! use ironseries::registry::Registry;
//!
//! let cfg: ProjectConfig = serde_json::from_value(serde_json::json!({
//!     "contracts": [{"id": "clock", "source": {"loader": "synthetic", "params":
//!         {"start": "2024-01-01T00:00:00Z", "end": "2024-01-01T05:00:00Z"}}}],
//!     "dataset": {"group_by": "1h", "features": [{"id": "t", "stream": "clock"}]}
//! }))?;
//! let dir = tempfile::tempdir()?;
//! let ctx = PipelineContext::new(Registry::with_builtins(), ArtifactStore::new(dir.path()));
//! let samples: Vec<_> = VectorPipeline::new(&cfg, &ctx)?.samples()?.collect::<anyhow::Result<_>>()?;
//! assert_eq!(samples.len(), 6);
//! # anyhow::Ok(())
//! ```

use crate::artifacts::ArtifactStore;
use crate::assembler::{AssemblerInput, VectorAssembler};
use crate::compose::Aligner;
use crate::config::{ContractSpec, ProjectConfig};
use crate::engine::apply_stream_rules;
use crate::error::EngineError;
use crate::fanout::SharedStream;
use crate::feature::{FeatureProjector, FeatureSpec};
use crate::filters::apply_record_rules;
use crate::lint::{LintCollector, apply_debug_rules};
use crate::metrics::{Counter, RunMetrics};
use crate::ordering::{OrderGuard, SortConfig, order_records};
use crate::postprocess::postprocessor;
use crate::record::{RecordStream, TemporalRecord};
use crate::registry::Registry;
use crate::runner::{Cancellable, CancellationToken, ExecMode, drive_with};
use crate::sample::{Payload, Sample, SampleStream};
use crate::split::Splitter;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Everything a run needs besides its configuration.
#[derive(Debug)]
pub struct PipelineContext {
    registry: Registry,
    store: ArtifactStore,
    metrics: RunMetrics,
    cancel: CancellationToken,
    lints: LintCollector,
    mode: Option<ExecMode>,
}

impl PipelineContext {
    #[must_use]
    pub fn new(registry: Registry, store: ArtifactStore) -> Self {
        Self {
            registry,
            store,
            metrics: RunMetrics::new(),
            cancel: CancellationToken::new(),
            lints: LintCollector::new(),
            mode: None,
        }
    }

    /// Override `run.parallel` / `run.prefetch` from the project.
    #[must_use]
    pub const fn with_exec_mode(mut self, mode: ExecMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        &self.store
    }

    #[must_use]
    pub const fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub const fn lints(&self) -> &LintCollector {
        &self.lints
    }

    #[must_use]
    pub fn exec_mode(&self, config: &ProjectConfig) -> ExecMode {
        self.mode.unwrap_or_else(|| config.run.exec_mode())
    }
}

/* ===================== stream graph ===================== */

/// One [`SharedStream`] per canonical stream that something reads.
struct StreamGraph {
    shared: BTreeMap<String, SharedStream>,
}

impl StreamGraph {
    /// Build shared streams for `roots` and everything they are composed from.
    ///
    /// Readers of composed inputs are attached here, before anything pulls,
    /// so no reader ever misses a released record.
    fn build(config: &ProjectConfig, ctx: &PipelineContext, roots: &BTreeSet<String>) -> Result<Self> {
        let mut needed = BTreeSet::new();
        let mut pending: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(id) = pending.pop() {
            if !needed.insert(id.to_string()) {
                continue;
            }
            let contract = config.contract(id).ok_or_else(|| EngineError::config("dataset", format!("unknown stream `{id}`")))?;
            pending.extend(contract.dependencies());
        }

        let mode = ctx.exec_mode(config);
        let mut shared: BTreeMap<String, SharedStream> = BTreeMap::new();
        for id in config.composition_order()? {
            if !needed.contains(&id) {
                continue;
            }
            let Some(contract) = config.contract(&id) else {
                continue;
            };
            let upstream = Upstream::resolve(contract, ctx, &shared)?;
            let regular = Regularize::new(contract, config, ctx, mode);
            let token = ctx.cancel.clone();
            let mut stream = SharedStream::new(id.clone(), config.run.fanout_memory_limit, move || {
                let raw = upstream.open()?;
                Ok(regular.apply(Box::new(Cancellable::new(raw, token))))
            })
            .with_metrics(ctx.metrics.clone());
            if let Some(dir) = &config.run.spill_dir {
                stream = stream.with_spill_dir(dir.clone());
            }
            debug!(stream = %id, composed = contract.compose.is_some(), "canonical stream registered");
            shared.insert(id, stream);
        }
        Ok(Self { shared })
    }

    fn reader(&self, id: &str) -> Result<RecordStream> {
        let stream = self.shared.get(id).ok_or_else(|| EngineError::config("dataset", format!("unknown stream `{id}`")))?;
        Ok(Box::new(stream.reader()?))
    }
}

/// Where a canonical stream's records come from.
enum Upstream {
    Source {
        factory: std::sync::Arc<dyn crate::registry::SourceFactory>,
        params: serde_json::Value,
        metrics: RunMetrics,
    },
    Composed(Box<dyn FnOnce() -> Result<RecordStream> + Send>),
}

impl Upstream {
    fn resolve(contract: &ContractSpec, ctx: &PipelineContext, shared: &BTreeMap<String, SharedStream>) -> Result<Self> {
        if let Some(source) = &contract.source {
            let factory = ctx.registry.source(&source.loader).with_context(|| format!("contract `{}`", contract.id))?;
            return Ok(Self::Source { factory, params: source.params.clone(), metrics: ctx.metrics.clone() });
        }
        let compose = contract
            .compose
            .as_ref()
            .ok_or_else(|| EngineError::config(format!("contracts.{}", contract.id), "no source or compose"))?;
        let function = ctx.registry.compose(&compose.function).with_context(|| format!("contract `{}`", contract.id))?;
        let mut inputs = Vec::with_capacity(compose.inputs.len());
        for input in &compose.inputs {
            let stream = shared
                .get(&input.stream)
                .ok_or_else(|| EngineError::config(format!("contracts.{}.compose.inputs", contract.id), format!("unknown stream `{}`", input.stream)))?;
            let reader: RecordStream = Box::new(stream.reader()?);
            inputs.push((input.alias().to_string(), reader));
        }
        let id = contract.id.clone();
        let required = compose.required.clone();
        let partition_by = contract.partition_by.clone();
        let params = compose.params.clone();
        let metrics = ctx.metrics.clone();
        Ok(Self::Composed(Box::new(move || {
            let aligner = Aligner::new(id, inputs, required.as_deref(), partition_by, function, params, metrics)?;
            Ok(Box::new(aligner) as RecordStream)
        })))
    }

    fn open(self) -> Result<RecordStream> {
        match self {
            Self::Source { factory, params, metrics } => {
                let raw = factory.open(&params)?;
                Ok(Box::new(raw.inspect(move |r| {
                    if r.is_ok() {
                        metrics.increment(Counter::RecordsIn, 1);
                    }
                })))
            }
            Self::Composed(open) => open(),
        }
    }
}

/// Record rules, ordering, stream rules and debug rules of one contract.
struct Regularize {
    contract: ContractSpec,
    sort: SortConfig,
    metrics: RunMetrics,
    lints: LintCollector,
}

impl Regularize {
    fn new(contract: &ContractSpec, config: &ProjectConfig, ctx: &PipelineContext, mode: ExecMode) -> Self {
        Self {
            contract: contract.clone(),
            sort: sort_config(config, ctx, mode, contract.sort_batch_size),
            metrics: ctx.metrics.clone(),
            lints: ctx.lints.clone(),
        }
    }

    fn apply(self, raw: RecordStream) -> RecordStream {
        let c = &self.contract;
        let filtered = apply_record_rules(raw, &c.record, &self.metrics);
        let ordered = order_records(filtered, c.partition_by.clone(), self.sort);
        let regular = apply_stream_rules(ordered, &c.partition_by, &c.stream, &self.metrics);
        let checked = apply_debug_rules(regular, &c.id, &c.partition_by, &c.debug, &self.metrics, &self.lints);
        let partition_by = c.partition_by.clone();
        Box::new(OrderGuard::new(checked, "regularize", move |r: &TemporalRecord| (r.partition_key(&partition_by), r.time)))
    }
}

fn sort_config(config: &ProjectConfig, ctx: &PipelineContext, mode: ExecMode, batch_size: usize) -> SortConfig {
    SortConfig {
        batch_size: batch_size.max(1),
        max_memory_runs: config.run.max_memory_runs,
        parallel: mode.is_parallel() && num_cpus::get() > 1,
        spill_dir: config.run.spill_dir.clone(),
        metrics: Some(ctx.metrics.clone()),
    }
}

/* ===================== vector pipeline ===================== */

#[derive(Clone, Debug, PartialEq, Eq)]
enum Purpose {
    /// Unscaled vectors for schema and metadata.
    Profile,
    /// Unscaled vectors of one split label for scaler statistics.
    ScalerFit(Option<String>),
    /// The configured output.
    Run,
}

/// A configured, not yet started, sample pipeline.
pub struct VectorPipeline<'a> {
    config: &'a ProjectConfig,
    ctx: &'a PipelineContext,
    purpose: Purpose,
}

impl<'a> VectorPipeline<'a> {
    /// The full pipeline: scaling, postprocess and split as configured.
    ///
    /// # Errors
    /// Invalid configuration.
    pub fn new(config: &'a ProjectConfig, ctx: &'a PipelineContext) -> Result<Self> {
        Self::with_purpose(config, ctx, Purpose::Run)
    }

    /// Raw vectors: no scaling, postprocess, split or rectangular padding.
    ///
    /// # Errors
    /// Invalid configuration.
    pub fn profiling(config: &'a ProjectConfig, ctx: &'a PipelineContext) -> Result<Self> {
        Self::with_purpose(config, ctx, Purpose::Profile)
    }

    /// Raw vectors restricted to the split `label`, or all vectors when `None`.
    ///
    /// # Errors
    /// Invalid configuration.
    pub fn scaler_fit(config: &'a ProjectConfig, ctx: &'a PipelineContext, label: Option<String>) -> Result<Self> {
        Self::with_purpose(config, ctx, Purpose::ScalerFit(label))
    }

    fn with_purpose(config: &'a ProjectConfig, ctx: &'a PipelineContext, purpose: Purpose) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, ctx, purpose })
    }

    fn feature_specs(&self) -> Vec<(Payload, FeatureSpec)> {
        let ds = &self.config.dataset;
        let specs = ds
            .features
            .iter()
            .map(|f| (Payload::Features, f.clone()))
            .chain(ds.targets.iter().map(|f| (Payload::Targets, f.clone())));
        match self.purpose {
            Purpose::Run => specs.collect(),
            Purpose::Profile | Purpose::ScalerFit(_) => specs.map(|(p, f)| (p, FeatureSpec { scale: None, ..f })).collect(),
        }
    }

    /// Build every stage and return the sample stream. Nothing is pulled yet.
    ///
    /// # Errors
    /// Missing artifacts, unknown loaders or compose functions, or worker
    /// threads that cannot be spawned.
    pub fn samples(&self) -> Result<SampleStream> {
        let config = self.config;
        let ctx = self.ctx;
        let mode = ctx.exec_mode(config);
        let group_by = config.dataset.group_by;
        let specs = self.feature_specs();

        let scaler = if specs.iter().any(|(_, f)| f.scaling().is_some_and(|o| !o.is_inline())) {
            ctx.store.scaler()?
        } else {
            None
        };

        let roots: BTreeSet<String> = specs.iter().map(|(_, f)| f.stream.clone()).collect();
        let graph = StreamGraph::build(config, ctx, &roots)?;
        ctx.metrics.record_start();

        // Every reader is attached before any worker starts pulling.
        let attached = specs
            .into_iter()
            .map(|(role, spec)| graph.reader(&spec.stream).map(|records| (role, spec, records)))
            .collect::<Result<Vec<_>>>()?;
        let mut inputs = Vec::with_capacity(attached.len());
        for (role, spec, records) in attached {
            let name = spec.id.clone();
            let batch = config.contract(&spec.stream).map_or(crate::ordering::DEFAULT_SORT_BATCH_SIZE, |c| c.sort_batch_size);
            let projector = FeatureProjector::new(spec, group_by, scaler.as_ref(), sort_config(config, ctx, mode, batch))
                .with_context(|| format!("feature `{name}`"))?;
            let events = drive_with(mode, &name, projector.project(records))?;
            inputs.push(AssemblerInput::new(name, role, events));
        }
        debug!(inputs = inputs.len(), ?mode, "assembler inputs ready");

        let configured = config.dataset.window.as_ref().map(crate::config::WindowSpec::bounds).transpose()?;
        let mut assembler = VectorAssembler::new(inputs, ctx.metrics.clone());
        let mut stream: SampleStream = if self.purpose == Purpose::Run && config.dataset.rectangular {
            let window = match configured {
                Some(w) => w,
                None => ctx
                    .store
                    .metadata()?
                    .and_then(|m| m.window)
                    .ok_or_else(|| EngineError::MissingArtifact("metadata".to_string()))?
                    .bounds()?,
            };
            assembler = assembler.rectangular(window, group_by);
            Box::new(assembler)
        } else if let Some(window) = configured {
            Box::new(assembler.filter(move |s| !matches!(s, Ok(s) if !window.contains(s.key))))
        } else {
            Box::new(assembler)
        };

        match &self.purpose {
            Purpose::Run => {
                let schema = ctx.store.schema()?;
                if !config.postprocess.is_empty() || schema.is_some() {
                    let metadata = ctx.store.metadata()?;
                    let post = postprocessor(schema.as_ref(), metadata.as_ref(), &config.postprocess, ctx.metrics.clone())?;
                    stream = post.apply(stream);
                }
                if let Some(split) = &config.split {
                    stream = Splitter::new(split, ctx.metrics.clone())?.apply(stream);
                }
            }
            Purpose::ScalerFit(Some(label)) => {
                if let Some(split) = &config.split {
                    stream = Splitter::new(split, ctx.metrics.clone())?.keeping(label.clone()).apply(stream);
                }
            }
            Purpose::ScalerFit(None) | Purpose::Profile => {}
        }

        info!(purpose = ?self.purpose, streams = graph.shared.len(), "pipeline built");
        let finish = RunFinish { inner: Cancellable::new(stream, ctx.cancel.clone()), metrics: ctx.metrics.clone(), done: false };
        Ok(Box::new(finish))
    }
}

/// Counts emitted samples and logs the drop summary once the stream ends.
struct RunFinish<I> {
    inner: I,
    metrics: RunMetrics,
    done: bool,
}

impl<I: Iterator<Item = Result<Sample>>> Iterator for RunFinish<I> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.inner.next();
        match &item {
            Some(Ok(_)) => self.metrics.increment(Counter::SamplesEmitted, 1),
            Some(Err(_)) | None => {
                self.done = true;
                self.metrics.record_end();
                self.metrics.summary();
            }
        }
        item
    }
}

/// Build a pipeline and collect its samples.
///
/// # Errors
/// Any construction or run error.
pub fn run_to_vec(config: &ProjectConfig, ctx: &PipelineContext) -> Result<Vec<Sample>> {
    VectorPipeline::new(config, ctx)?.samples()?.collect()
}
