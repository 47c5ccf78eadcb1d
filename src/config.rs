//! Project configuration.
//!
//! A project is one JSON document:
//!
//! ```
//! use ironseries::config::ProjectConfig;
//!
//! let cfg: ProjectConfig = serde_json::from_str(r#"{
//!     "contracts": [
//!         {"id": "ticks", "source": {"loader": "synthetic",
//!             "params": {"start": "2024-01-01T00:00:00Z", "end": "2024-01-02T00:00:00Z"}},
//!          "stream": [{"kind": "ensure_cadence", "tick": "1h"}]}
//!     ],
//!     "dataset": {"group_by": "1h", "features": [{"id": "clock", "stream": "ticks"}]},
//!     "split": {"mode": "hash", "seed": 42, "ratios": {"train": 0.8, "val": 0.1, "test": 0.1}}
//! }"#)?;
//! cfg.validate()?;
//! # anyhow::Ok(())
//! ```
//!
//! [`ProjectConfig::validate`] runs before any iterator is built and rejects
//! the whole document on the first problem, naming its config path.

use crate::artifacts::WindowMode;
use crate::compose::ComposeInput;
use crate::engine::StreamRule;
use crate::error::EngineError;
use crate::feature::FeatureSpec;
use crate::filters::RecordRule;
use crate::fanout::DEFAULT_MEMORY_LIMIT;
use crate::lint::DebugRule;
use crate::ordering::{DEFAULT_MAX_MEMORY_RUNS, DEFAULT_SORT_BATCH_SIZE};
use crate::postprocess::VectorTransform;
use crate::runner::{DEFAULT_PREFETCH, ExecMode};
use crate::split::SplitSpec;
use crate::window::{Cadence, Window, parse_timestamp};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

const fn default_sort_batch_size() -> usize {
    DEFAULT_SORT_BATCH_SIZE
}

fn config_err(path: impl Into<String>, message: impl Into<String>) -> anyhow::Error {
    EngineError::config(path, message).into()
}

/* ===================== contracts ===================== */

/// A raw source: a registered loader name and its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub loader: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A composed stream: aligned inputs and a registered compose function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComposeSpec {
    pub inputs: Vec<ComposeInput>,
    #[serde(alias = "fn")]
    pub function: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Aliases that must be present for a row to compose; all when absent.
    #[serde(default)]
    pub required: Option<Vec<String>>,
}

/// One canonical stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub id: String,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub compose: Option<ComposeSpec>,
    #[serde(default)]
    pub partition_by: Vec<String>,
    #[serde(default = "default_sort_batch_size")]
    pub sort_batch_size: usize,
    #[serde(default)]
    pub record: Vec<RecordRule>,
    #[serde(default)]
    pub stream: Vec<StreamRule>,
    #[serde(default)]
    pub debug: Vec<DebugRule>,
}

impl ContractSpec {
    /// Stream ids this contract reads from.
    #[must_use]
    pub fn dependencies(&self) -> Vec<&str> {
        self.compose.as_ref().map_or_else(Vec::new, |c| c.inputs.iter().map(|i| i.stream.as_str()).collect())
    }
}

/* ===================== dataset ===================== */

/// Declared time window, `[start, end)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub start: String,
    pub end: String,
}

impl WindowSpec {
    /// # Errors
    /// Unparseable bounds or `start >= end`.
    pub fn bounds(&self) -> Result<Window> {
        let start = parse_timestamp(&self.start).context("dataset.window.start")?;
        let end = parse_timestamp(&self.end).context("dataset.window.end")?;
        if start >= end {
            return Err(config_err("dataset.window", "start must be before end"));
        }
        Ok(Window::new(start, end))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub group_by: Cadence,
    #[serde(default)]
    pub features: Vec<FeatureSpec>,
    #[serde(default)]
    pub targets: Vec<FeatureSpec>,
    #[serde(default)]
    pub window: Option<WindowSpec>,
    /// Emit every bucket of the window, filled or not.
    #[serde(default)]
    pub rectangular: bool,
}

/* ===================== run ===================== */

const fn yes() -> bool {
    true
}

const fn default_prefetch() -> usize {
    DEFAULT_PREFETCH
}

const fn default_memory_limit() -> usize {
    DEFAULT_MEMORY_LIMIT
}

const fn default_memory_runs() -> usize {
    DEFAULT_MAX_MEMORY_RUNS
}

/// Execution knobs. None of them changes the emitted samples.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    #[serde(default = "yes")]
    pub parallel: bool,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Records a fan-out keeps in memory before spilling.
    #[serde(default = "default_memory_limit")]
    pub fanout_memory_limit: usize,
    #[serde(default = "default_memory_runs")]
    pub max_memory_runs: usize,
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,
    /// How the metadata window is derived when none is configured.
    #[serde(default)]
    pub window_mode: WindowMode,
    /// Split label scaler statistics are fitted on; `split.keep` or `train` when absent.
    #[serde(default)]
    pub scaler_label: Option<String>,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            parallel: true,
            prefetch: DEFAULT_PREFETCH,
            fanout_memory_limit: DEFAULT_MEMORY_LIMIT,
            max_memory_runs: DEFAULT_MAX_MEMORY_RUNS,
            spill_dir: None,
            window_mode: WindowMode::default(),
            scaler_label: None,
        }
    }
}

impl RunSpec {
    #[must_use]
    pub const fn exec_mode(&self) -> ExecMode {
        if self.parallel { ExecMode::Parallel { prefetch: self.prefetch } } else { ExecMode::Sequential }
    }
}

/* ===================== project ===================== */

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub contracts: Vec<ContractSpec>,
    pub dataset: DatasetSpec,
    #[serde(default)]
    pub postprocess: Vec<VectorTransform>,
    #[serde(default)]
    pub split: Option<SplitSpec>,
    #[serde(default)]
    pub run: RunSpec,
}

impl ProjectConfig {
    /// Read and parse a JSON project file. Does not validate.
    ///
    /// # Errors
    /// I/O or parse errors, with the file path attached.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("read project {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse project {}", path.display()))
    }

    #[must_use]
    pub fn contract(&self, id: &str) -> Option<&ContractSpec> {
        self.contracts.iter().find(|c| c.id == id)
    }

    /// # Errors
    /// The first [`EngineError::Config`] found.
    pub fn validate(&self) -> Result<()> {
        self.validate_contracts()?;
        self.composition_order()?;
        self.validate_dataset()?;
        self.validate_postprocess()?;
        if let Some(split) = &self.split {
            split.validate()?;
            if let Some(keep) = &split.keep
                && !split.labels().contains(keep)
            {
                return Err(config_err("split.keep", format!("`{keep}` is not a split label")));
            }
        }
        Ok(())
    }

    fn validate_contracts(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (i, c) in self.contracts.iter().enumerate() {
            let at = format!("contracts[{i}]");
            if c.id.is_empty() {
                return Err(config_err(format!("{at}.id"), "stream id must not be empty"));
            }
            if !seen.insert(c.id.as_str()) {
                return Err(config_err(format!("{at}.id"), format!("duplicate stream id `{}`", c.id)));
            }
            match (&c.source, &c.compose) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => return Err(config_err(&at, "exactly one of `source` or `compose` is required")),
            }
            if c.sort_batch_size == 0 {
                return Err(config_err(format!("{at}.sort_batch_size"), "must be positive"));
            }
            if let Some(compose) = &c.compose {
                if compose.inputs.is_empty() {
                    return Err(config_err(format!("{at}.compose.inputs"), "at least one input is required"));
                }
                let mut aliases = BTreeSet::new();
                for input in &compose.inputs {
                    if !aliases.insert(input.alias()) {
                        return Err(config_err(format!("{at}.compose.inputs"), format!("duplicate alias `{}`", input.alias())));
                    }
                }
                if let Some(req) = &compose.required
                    && let Some(unknown) = req.iter().find(|r| !aliases.contains(r.as_str()))
                {
                    return Err(config_err(format!("{at}.compose.required"), format!("`{unknown}` is not an input alias")));
                }
            }
            for (j, rule) in c.stream.iter().enumerate() {
                let rat = format!("{at}.stream[{j}]");
                match rule {
                    StreamRule::Fill(f) => {
                        if f.window == Some(0) {
                            return Err(config_err(format!("{rat}.window"), "must be positive"));
                        }
                        if f.min_samples == 0 {
                            return Err(config_err(format!("{rat}.min_samples"), "must be positive"));
                        }
                    }
                    StreamRule::Rolling(r) => {
                        if r.window == 0 {
                            return Err(config_err(format!("{rat}.window"), "must be positive"));
                        }
                        if r.min_samples == Some(0) || r.min_samples.is_some_and(|m| m > r.window) {
                            return Err(config_err(format!("{rat}.min_samples"), "must be in 1..=window"));
                        }
                    }
                    _ => {}
                }
            }
        }
        for c in &self.contracts {
            for dep in c.dependencies() {
                if !seen.contains(dep) {
                    return Err(config_err(format!("contracts.{}.compose.inputs", c.id), format!("unknown stream `{dep}`")));
                }
            }
        }
        Ok(())
    }

    /// Contract ids in dependency order (inputs before the streams composed from them).
    ///
    /// # Errors
    /// A cycle among composed streams, reported with its path.
    pub fn composition_order(&self) -> Result<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            id: &'a str,
            deps: &HashMap<&'a str, Vec<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == id).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(id);
                    return Err(config_err(
                        format!("contracts.{id}.compose.inputs"),
                        format!("composition cycle: {}", cycle.join(" -> ")),
                    ));
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            path.push(id);
            for dep in deps.get(id).into_iter().flatten() {
                visit(*dep, deps, marks, path, order)?;
            }
            path.pop();
            marks.insert(id, Mark::Done);
            order.push(id.to_string());
            Ok(())
        }

        let deps: HashMap<&str, Vec<&str>> = self.contracts.iter().map(|c| (c.id.as_str(), c.dependencies())).collect();
        let mut marks = HashMap::new();
        let mut order = Vec::with_capacity(self.contracts.len());
        for c in &self.contracts {
            visit(&c.id, &deps, &mut marks, &mut Vec::new(), &mut order)?;
        }
        Ok(order)
    }

    fn validate_dataset(&self) -> Result<()> {
        let ds = &self.dataset;
        if ds.features.is_empty() && ds.targets.is_empty() {
            return Err(config_err("dataset.features", "at least one feature or target is required"));
        }
        let mut ids: BTreeMap<&str, String> = BTreeMap::new();
        let all = ds.features.iter().map(|f| ("features", f)).chain(ds.targets.iter().map(|f| ("targets", f)));
        for (i, (section, f)) in all.enumerate() {
            let at = format!("dataset.{section}.{}", f.id);
            if f.id.is_empty() {
                return Err(config_err(format!("dataset.{section}[{i}].id"), "feature id must not be empty"));
            }
            if let Some(prev) = ids.insert(&f.id, at.clone()) {
                return Err(config_err(&at, format!("duplicate feature id, first declared at {prev}")));
            }
            if self.contract(&f.stream).is_none() {
                return Err(config_err(format!("{at}.stream"), format!("unknown stream `{}`", f.stream)));
            }
            if let Some(seq) = &f.sequence {
                if seq.size == 0 {
                    return Err(config_err(format!("{at}.sequence.size"), "must be positive"));
                }
                if seq.stride == 0 {
                    return Err(config_err(format!("{at}.sequence.stride"), "must be positive"));
                }
            }
            if let Some(opts) = f.scaling()
                && !(opts.epsilon > 0.0)
            {
                return Err(config_err(format!("{at}.scale.epsilon"), "must be positive"));
            }
        }
        if let Some(w) = &ds.window {
            w.bounds()?;
        }
        Ok(())
    }

    fn validate_postprocess(&self) -> Result<()> {
        let unit = |v: f64| (0.0..=1.0).contains(&v);
        for (i, t) in self.postprocess.iter().enumerate() {
            let at = format!("postprocess[{i}]");
            match t {
                VectorTransform::Drop(r) => {
                    if !unit(r.threshold) {
                        return Err(config_err(format!("{at}.threshold"), "must be in [0, 1]"));
                    }
                }
                VectorTransform::DropMissing(r) => {
                    if !unit(r.min_coverage) {
                        return Err(config_err(format!("{at}.min_coverage"), "must be in [0, 1]"));
                    }
                }
                VectorTransform::Fill(r) => {
                    if r.window == Some(0) {
                        return Err(config_err(format!("{at}.window"), "must be positive"));
                    }
                    if r.min_samples == 0 {
                        return Err(config_err(format!("{at}.min_samples"), "must be positive"));
                    }
                }
                VectorTransform::FillAcrossPartitions(r) => {
                    if r.min_samples == 0 {
                        return Err(config_err(format!("{at}.min_samples"), "must be positive"));
                    }
                }
                VectorTransform::Replace(_) => {}
            }
        }
        Ok(())
    }
}
