use anyhow::Result;
use ironseries::io::jsonl::write_samples;
use ironseries::prelude::*;
use ironseries::testing::{CountingSource, HOUR_MS, RecordBuilder, hourly_project};
use ironseries::Counter;
use ironseries::compose::AlignedRow;
use ironseries::error::engine_error;
use ironseries::pipeline::run_to_vec;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context(root: &Path, mode: ExecMode) -> PipelineContext {
    PipelineContext::new(Registry::with_builtins(), ArtifactStore::new(root)).with_exec_mode(mode)
}

/// JSONL bytes per split label.
fn run_by_label(cfg: &ProjectConfig, ctx: &PipelineContext) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut by_label: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
    for sample in VectorPipeline::new(cfg, ctx)?.samples()? {
        let sample = sample?;
        by_label.entry(sample.split.clone().unwrap_or_default()).or_default().push(sample);
    }
    by_label
        .into_iter()
        .map(|(label, samples)| -> Result<(String, Vec<u8>)> {
            let mut bytes = Vec::new();
            write_samples(&mut bytes, samples.into_iter().map(Ok))?;
            Ok((label, bytes))
        })
        .collect()
}

#[test]
fn reruns_are_byte_identical() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let cfg = hourly_project(99)?;
    let ctx = context(dir.path(), ExecMode::Sequential);
    build_artifacts(&cfg, &ctx, false)?;

    let first = run_by_label(&cfg, &ctx)?;
    let second = run_by_label(&cfg, &ctx)?;
    assert_eq!(first, second);
    assert_eq!(first.keys().map(String::as_str).collect::<Vec<_>>(), vec!["test", "train", "val"]);
    Ok(())
}

#[test]
fn parallel_and_sequential_runs_agree() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let cfg = hourly_project(99)?;
    let sequential = context(dir.path(), ExecMode::Sequential);
    build_artifacts(&cfg, &sequential, false)?;
    let parallel = context(dir.path(), ExecMode::Parallel { prefetch: 4 });
    assert_eq!(run_by_label(&cfg, &sequential)?, run_by_label(&cfg, &parallel)?);
    Ok(())
}

#[test]
fn samples_carry_features_targets_and_labels() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = hourly_project(23)?;
    build_artifacts(&cfg, &context(dir.path(), ExecMode::Sequential), false)?;
    // A fresh context, so the build passes do not count towards this run.
    let ctx = context(dir.path(), ExecMode::Sequential);
    let samples: Vec<Sample> = VectorPipeline::new(&cfg, &ctx)?.samples()?.collect::<Result<_>>()?;
    assert_eq!(samples.len(), 24);
    assert!(samples.windows(2).all(|w| w[0].key < w[1].key));
    let six = &samples[6];
    let phase = six.targets.get("phase").and_then(FeatureValue::as_f64).expect("phase target");
    assert!((phase - 1.0).abs() < 1e-12);
    assert_eq!(ctx.metrics().get(Counter::SamplesEmitted), 24);
    Ok(())
}

fn shared_project() -> Result<ProjectConfig> {
    Ok(serde_json::from_value(json!({
        "contracts": [
            {"id": "raw", "source": {"loader": "counting"}},
            {"id": "tenfold", "source": {"loader": "tenfold"}},
            {"id": "total", "compose": {"inputs": [{"stream": "raw"}, {"stream": "tenfold"}], "function": "sum"}}
        ],
        "dataset": {
            "group_by": "1h",
            "features": [
                {"id": "level", "stream": "raw"},
                {"id": "recent", "stream": "raw", "sequence": {"size": 3}},
                {"id": "total", "stream": "total"}
            ]
        }
    }))?)
}

fn shared_run(mode: ExecMode) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let raw = CountingSource::new((0..24).map(|h| RecordBuilder::at(h * HOUR_MS).value(h as f64).build()).collect());
    let tenfold = CountingSource::new((0..24).map(|h| RecordBuilder::at(h * HOUR_MS).value(10.0 * h as f64).build()).collect());
    let mut registry = Registry::with_builtins();
    registry.register_source("counting", raw.clone()).register_source("tenfold", tenfold.clone());
    let ctx = PipelineContext::new(registry, ArtifactStore::new(dir.path())).with_exec_mode(mode);
    let cfg = shared_project()?;

    let samples: Vec<Sample> = VectorPipeline::new(&cfg, &ctx)?.samples()?.collect::<Result<_>>()?;
    assert_eq!(raw.opens(), 1, "raw is read by two features and one composition");
    assert_eq!(raw.pulls(), 24);
    assert_eq!(tenfold.opens(), 1);

    assert_eq!(samples.len(), 24);
    for (h, s) in samples.iter().enumerate() {
        let h = h as f64;
        assert_eq!(s.features["level"].as_f64(), Some(h));
        assert_eq!(s.features["total"].as_f64(), Some(11.0 * h));
        assert_eq!(s.features.contains_key("recent"), h >= 2.0);
    }
    assert_eq!(
        samples[5].features["recent"],
        FeatureValue::Sequence(vec![Value::Number(3.0), Value::Number(4.0), Value::Number(5.0)])
    );
    Ok(())
}

#[test]
fn shared_sources_open_once_sequential() -> Result<()> {
    shared_run(ExecMode::Sequential)
}

#[test]
fn shared_sources_open_once_parallel() -> Result<()> {
    shared_run(ExecMode::Parallel { prefetch: 2 })
}

#[test]
fn cancellation_ends_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = hourly_project(99)?;
    let token = CancellationToken::new();
    let ctx = context(dir.path(), ExecMode::Parallel { prefetch: 2 }).with_cancellation(token.clone());
    let mut samples = VectorPipeline::new(&cfg, &ctx)?.samples()?;
    assert!(samples.next().transpose()?.is_some());
    token.cancel();
    let err = samples.next().expect("an error after cancellation").err().expect("cancelled");
    assert!(matches!(engine_error(&err), Some(EngineError::Cancelled)));
    assert!(samples.next().is_none());
    Ok(())
}

#[test]
fn configured_window_limits_samples() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context(dir.path(), ExecMode::Sequential);
    let mut cfg = hourly_project(9)?;
    cfg.dataset.window = Some(ironseries::config::WindowSpec {
        start: "2024-01-01T02:00:00Z".into(),
        end: "2024-01-01T05:00:00Z".into(),
    });
    let keys: Vec<i64> = VectorPipeline::new(&cfg, &ctx)?.samples()?.map(|s| s.map(|s| s.key)).collect::<Result<_>>()?;
    let start = keys[0];
    assert_eq!(keys, vec![start, start + HOUR_MS, start + 2 * HOUR_MS]);

    // Rectangular mode pads the window with empty samples.
    cfg.dataset.window = Some(ironseries::config::WindowSpec {
        start: "2023-12-31T22:00:00Z".into(),
        end: "2024-01-01T12:00:00Z".into(),
    });
    cfg.dataset.rectangular = true;
    let samples: Vec<Sample> = VectorPipeline::new(&cfg, &ctx)?.samples()?.collect::<Result<_>>()?;
    assert_eq!(samples.len(), 14);
    assert_eq!(samples.iter().filter(|s| s.is_empty()).count(), 4);
    Ok(())
}

#[test]
fn rectangular_without_window_needs_metadata() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = context(dir.path(), ExecMode::Sequential);
    let mut cfg = hourly_project(9)?;
    cfg.dataset.rectangular = true;
    let err = VectorPipeline::new(&cfg, &ctx)?.samples().err().expect("metadata missing");
    assert!(matches!(engine_error(&err), Some(EngineError::MissingArtifact(_))));

    build_artifacts(&cfg, &ctx, false)?;
    assert_eq!(VectorPipeline::new(&cfg, &ctx)?.samples()?.count(), 10);
    Ok(())
}

#[test]
fn unknown_loader_is_a_config_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = PipelineContext::new(Registry::new(), ArtifactStore::new(dir.path()));
    let cfg = hourly_project(3)?;
    let err = VectorPipeline::new(&cfg, &ctx)?.samples().err().expect("no loaders registered");
    assert!(matches!(engine_error(&err), Some(EngineError::Config { .. })));
    Ok(())
}

#[test]
fn custom_compose_with_exported_metrics_and_lints() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let gappy = (0..10).filter(|h| !(3..5).contains(h));
    let raw = CountingSource::new(gappy.map(|h| RecordBuilder::at(h * HOUR_MS).value(h as f64).build()).collect());
    let tenfold = CountingSource::new((0..10).map(|h| RecordBuilder::at(h * HOUR_MS).value(10.0 * h as f64).build()).collect());
    let mut registry = Registry::with_builtins();
    registry
        .register_source("counting", raw)
        .register_source("tenfold", tenfold)
        .register_compose("spread", |row: &AlignedRow, _: &serde_json::Value| -> Result<Option<TemporalRecord>> {
            let (Some(a), Some(b)) = (row.get("a").and_then(|r| r.numeric("value")), row.get("b").and_then(|r| r.numeric("value"))) else {
                return Ok(None);
            };
            Ok(Some(TemporalRecord::new(row.time).with_field("value", b - a)))
        });
    let ctx = PipelineContext::new(registry, ArtifactStore::new(dir.path())).with_exec_mode(ExecMode::Sequential);
    let cfg: ProjectConfig = serde_json::from_value(json!({
        "contracts": [
            {"id": "raw", "source": {"loader": "counting"}, "debug": [{"kind": "cadence_lint", "tick": "1h"}]},
            {"id": "tenfold", "source": {"loader": "tenfold"}},
            {"id": "spread", "compose": {"inputs": [{"stream": "raw", "alias": "a"}, {"stream": "tenfold", "alias": "b"}], "function": "spread"}}
        ],
        "dataset": {"group_by": "1h", "features": [{"id": "spread", "stream": "spread"}]}
    }))?;

    let samples = run_to_vec(&cfg, &ctx)?;
    assert_eq!(samples.len(), 8);
    assert!(samples.iter().all(|s| s.features["spread"].as_f64() == Some(9.0 * (s.key / HOUR_MS) as f64)));
    assert_eq!(ctx.metrics().get(Counter::SamplesEmitted), 8);
    assert!(ctx.metrics().elapsed().is_some());

    let metrics_path = dir.path().join("metrics.json");
    ctx.metrics().save_to_file(&metrics_path)?;
    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&metrics_path)?)?;
    assert_eq!(saved["samples_emitted"], json!(8));
    assert!(saved.get("execution_time_ms").is_some());

    let lints_path = dir.path().join("lints.json");
    ctx.lints().write_to_file(&lints_path)?;
    let lints: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&lints_path)?)?;
    let lints = lints.as_array().expect("a list of violations");
    assert_eq!(lints.len(), 1);
    assert_eq!(lints[0]["stream"], json!("raw"));
    Ok(())
}
