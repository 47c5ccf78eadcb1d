//! Build cache for derived artifacts.
//!
//! Each artifact is keyed by a fingerprint: SHA-256 over the canonical JSON
//! (object keys sorted) of the configuration subset it depends on. The build
//! state file `build_state.json` under the artifact root records, per
//! artifact, the fingerprint and artifact version it was built from. An
//! artifact whose fingerprint, version and file all match is a cache hit and is
//! not recomputed unless the build is forced. The scaler is only fitted when
//! some feature scales against fitted statistics.
//!
//! At most one writer builds a given artifact: the builder holds an exclusive
//! `<key>.lock` file for the duration of the build. A second concurrent build
//! of the same artifact fails with [`EngineError::BuildInProgress`] instead of
//! racing. The lock file is removed when the guard drops, on every exit path.
//!
//! ```
//! use ironseries::build::fingerprint;
//! use serde_json::json;
//!
//! // Key order does not matter.
//! let a = fingerprint(&json!({"group_by": "1h", "features": ["temp"]}))?;
//! let b = fingerprint(&json!({"features": ["temp"], "group_by": "1h"}))?;
//! assert_eq!(a, b);
//! assert_eq!(a.len(), 64);
//! # anyhow::Ok(())
//! ```

use crate::artifacts::{ArtifactKind, ArtifactStore, ScalerFitter, VectorProfiler};
use crate::config::ProjectConfig;
use crate::error::EngineError;
use crate::pipeline::{PipelineContext, VectorPipeline};
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub const BUILD_STATE_FILE: &str = "build_state.json";
const STATE_LOCK: &str = "build_state";
const STATE_LOCK_ATTEMPTS: u32 = 200;

/// Split label scaler statistics are fitted on when the split keeps nothing.
pub const DEFAULT_FIT_LABEL: &str = "train";

/// Stable hash over the canonical JSON of `subset`.
///
/// # Errors
/// Fails when `subset` cannot be represented as JSON.
pub fn fingerprint<T: Serialize>(subset: &T) -> Result<String> {
    // `serde_json::Value` objects are ordered maps, so the text is canonical.
    let canonical = serde_json::to_string(&serde_json::to_value(subset)?)?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/* ===================== state ===================== */

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildEntry {
    pub fingerprint: String,
    pub version: u32,
    /// Artifact path relative to the store root.
    pub path: PathBuf,
    pub built_at: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    #[serde(default)]
    pub artifacts: BTreeMap<String, BuildEntry>,
}

/// Whether an artifact was reused, rebuilt, or skipped because nothing reads it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Hit,
    Built,
    NotNeeded,
}

/// Exclusive build lock on one artifact. Released on drop.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    _file: File,
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "lock file already gone");
        }
    }
}

/// Fingerprint-keyed cache over an [`ArtifactStore`].
#[derive(Clone, Debug)]
pub struct BuildCache {
    store: ArtifactStore,
}

impl BuildCache {
    #[must_use]
    pub const fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        &self.store
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.store.root().join(BUILD_STATE_FILE)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.store.root().join(format!("{key}.lock"))
    }

    /// Take the exclusive lock for `key`.
    ///
    /// # Errors
    /// [`EngineError::BuildInProgress`] when another writer holds it.
    pub fn lock(&self, key: &str) -> Result<BuildLock> {
        fs::create_dir_all(self.store.root())
            .map_err(|e| EngineError::Resource(format!("cannot create {}: {e}", self.store.root().display())))?;
        let path = self.lock_path(key);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => Ok(BuildLock { path, _file: file }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(EngineError::BuildInProgress(key.to_string()).into()),
            Err(e) => Err(EngineError::Resource(format!("cannot create lock {}: {e}", path.display())).into()),
        }
    }

    /// # Errors
    /// Fails when the state file exists but cannot be parsed.
    pub fn load_state(&self) -> Result<BuildState> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(BuildState::default());
        }
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    /// True when the recorded entry matches `fingerprint` and the artifact
    /// version, and the artifact file still exists.
    ///
    /// # Errors
    /// Fails when the state cannot be read.
    pub fn is_fresh(&self, kind: ArtifactKind, fingerprint: &str) -> Result<bool> {
        let state = self.load_state()?;
        Ok(state.artifacts.get(kind.key()).is_some_and(|e| {
            e.fingerprint == fingerprint && e.version == kind.version() && self.store.root().join(&e.path).exists()
        }))
    }

    fn state_lock(&self) -> Result<BuildLock> {
        for _ in 0..STATE_LOCK_ATTEMPTS {
            match self.lock(STATE_LOCK) {
                Ok(lock) => return Ok(lock),
                Err(e) if matches!(e.downcast_ref::<EngineError>(), Some(EngineError::BuildInProgress(_))) => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::BuildInProgress(STATE_LOCK.to_string()).into())
    }

    /// Record a freshly built artifact in the build state.
    ///
    /// # Errors
    /// Fails when the state file cannot be read or written.
    pub fn record(&self, kind: ArtifactKind, fingerprint: &str, path: PathBuf, meta: serde_json::Value) -> Result<()> {
        let _guard = self.state_lock()?;
        let mut state = self.load_state()?;
        state.artifacts.insert(
            kind.key().to_string(),
            BuildEntry {
                fingerprint: fingerprint.to_string(),
                version: kind.version(),
                path,
                built_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                meta,
            },
        );
        let target = self.state_path();
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&state)?)
            .map_err(|e| EngineError::Resource(format!("cannot write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &target)
            .map_err(|e| EngineError::Resource(format!("cannot move {} into place: {e}", target.display())))?;
        Ok(())
    }

    /// Build one artifact unless it is fresh. `build` returns the artifact and
    /// a small JSON summary stored alongside its build entry.
    ///
    /// # Errors
    /// [`EngineError::BuildInProgress`] on a concurrent build, or whatever
    /// `build` fails with.
    pub fn ensure<T, F>(&self, kind: ArtifactKind, fingerprint: &str, force: bool, build: F) -> Result<BuildOutcome>
    where
        T: Serialize,
        F: FnOnce() -> Result<(T, serde_json::Value)>,
    {
        let _lock = self.lock(kind.key())?;
        if !force && self.is_fresh(kind, fingerprint)? {
            info!(artifact = kind.key(), "artifact up to date");
            return Ok(BuildOutcome::Hit);
        }
        let (artifact, meta) = build().with_context(|| format!("build artifact `{}`", kind.key()))?;
        let path = self.store.save(kind, &artifact)?;
        self.record(kind, fingerprint, path, meta)?;
        info!(artifact = kind.key(), fingerprint = %&fingerprint[..12.min(fingerprint.len())], "artifact built");
        Ok(BuildOutcome::Built)
    }
}

/* ===================== project artifacts ===================== */

/// Fingerprints of the three artifacts for one project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprints {
    pub schema: String,
    pub metadata: String,
    pub scaler: String,
}

impl Fingerprints {
    /// Schema and metadata depend on the streams and the unscaled feature
    /// layout; scaler statistics also depend on the split and the fit label.
    ///
    /// # Errors
    /// Fails when the configuration cannot be represented as JSON.
    pub fn of(config: &ProjectConfig) -> Result<Self> {
        let ds = &config.dataset;
        let unscaled = |specs: &[crate::feature::FeatureSpec]| {
            specs
                .iter()
                .map(|f| {
                    let mut f = f.clone();
                    f.scale = None;
                    f
                })
                .collect::<Vec<_>>()
        };
        let base = json!({
            "contracts": config.contracts,
            "group_by": ds.group_by,
            "features": unscaled(&ds.features),
            "targets": unscaled(&ds.targets),
        });
        let schema = fingerprint(&json!({ "kind": "schema", "layout": base }))?;
        let metadata = fingerprint(&json!({
            "kind": "metadata",
            "layout": base,
            "window": ds.window,
            "window_mode": config.run.window_mode,
        }))?;
        let scaler = fingerprint(&json!({
            "kind": "scaler",
            "layout": base,
            "split": config.split,
            "fit_label": fit_label(config),
        }))?;
        Ok(Self { schema, metadata, scaler })
    }
}

/// Label the scaler is fitted on.
#[must_use]
pub fn fit_label(config: &ProjectConfig) -> Option<String> {
    let split = config.split.as_ref()?;
    Some(
        config
            .run
            .scaler_label
            .clone()
            .or_else(|| split.keep.clone())
            .unwrap_or_else(|| DEFAULT_FIT_LABEL.to_string()),
    )
}

/// Per-artifact outcome of [`build_artifacts`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub outcomes: BTreeMap<String, BuildOutcome>,
}

impl BuildReport {
    #[must_use]
    pub fn outcome(&self, kind: ArtifactKind) -> Option<BuildOutcome> {
        self.outcomes.get(kind.key()).copied()
    }
}

/// Build (or reuse) schema, metadata and scaler statistics for a project.
///
/// Schema and metadata share one profiling pass over unscaled, unsplit
/// samples; the scaler is fitted on the fit label's samples.
///
/// # Errors
/// Configuration, pipeline and I/O errors, and
/// [`EngineError::BuildInProgress`] when another build holds a lock.
pub fn build_artifacts(config: &ProjectConfig, ctx: &PipelineContext, force: bool) -> Result<BuildReport> {
    config.validate()?;
    let prints = Fingerprints::of(config)?;
    let cache = BuildCache::new(ctx.store().clone());
    let mut outcomes = BTreeMap::new();

    let _schema_lock = cache.lock(ArtifactKind::Schema.key())?;
    let _metadata_lock = cache.lock(ArtifactKind::Metadata.key())?;
    let schema_fresh = !force && cache.is_fresh(ArtifactKind::Schema, &prints.schema)?;
    let metadata_fresh = !force && cache.is_fresh(ArtifactKind::Metadata, &prints.metadata)?;
    if schema_fresh && metadata_fresh {
        info!("schema and metadata up to date");
    } else {
        let mut profiler = VectorProfiler::new();
        for sample in VectorPipeline::profiling(config, ctx)?.samples()? {
            profiler.observe(&sample?);
        }
        if !schema_fresh {
            let schema = profiler.schema();
            let meta = json!({ "features": schema.features.len(), "targets": schema.targets.len() });
            let path = cache.store().save(ArtifactKind::Schema, &schema)?;
            cache.record(ArtifactKind::Schema, &prints.schema, path, meta)?;
            info!(features = schema.features.len(), targets = schema.targets.len(), "schema built");
        }
        if !metadata_fresh {
            let configured = config.dataset.window.as_ref().map(crate::config::WindowSpec::bounds).transpose()?;
            let doc = profiler.metadata(config.run.window_mode, config.dataset.group_by, configured);
            let meta = json!({ "features": doc.features.len(), "targets": doc.targets.len() });
            let path = cache.store().save(ArtifactKind::Metadata, &doc)?;
            cache.record(ArtifactKind::Metadata, &prints.metadata, path, meta)?;
            info!(window = ?doc.window, "metadata built");
        }
    }
    outcomes.insert(ArtifactKind::Schema.key().to_string(), if schema_fresh { BuildOutcome::Hit } else { BuildOutcome::Built });
    outcomes.insert(ArtifactKind::Metadata.key().to_string(), if metadata_fresh { BuildOutcome::Hit } else { BuildOutcome::Built });

    let scaler = if needs_scaler(config) {
        cache.ensure(ArtifactKind::Scaler, &prints.scaler, force, || {
            let mut fitter = ScalerFitter::new();
            for sample in VectorPipeline::scaler_fit(config, ctx, fit_label(config))?.samples()? {
                fitter.observe(&sample?);
            }
            let stats = fitter.finish(true, true, crate::feature::ScaleOptions::default().epsilon);
            let meta = json!({ "features": stats.statistics.len(), "label": fit_label(config) });
            Ok((stats, meta))
        })?
    } else {
        debug!("no feature reads fitted statistics; scaler skipped");
        BuildOutcome::NotNeeded
    };
    outcomes.insert(ArtifactKind::Scaler.key().to_string(), scaler);
    Ok(BuildReport { outcomes })
}

/// The scaler is fitted only when some feature scales without inline statistics.
fn needs_scaler(config: &ProjectConfig) -> bool {
    config.dataset.features.iter().any(|f| f.scaling().is_some_and(|o| !o.is_inline()))
}

/// Remove every artifact and the build state under `root`.
///
/// # Errors
/// Fails when an existing file cannot be removed.
pub fn clear_artifacts(root: &Path) -> Result<()> {
    let mut names: Vec<String> = ArtifactKind::ALL.iter().map(|k| k.file_name().to_string()).collect();
    names.push(BUILD_STATE_FILE.to_string());
    for name in names {
        let path = root.join(name);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    Ok(())
}
