use anyhow::Result;
use ironseries::artifacts::{EntryKind, SchemaArtifact, VectorProfiler, WindowMode};
use ironseries::error::{EngineError, engine_error};
use ironseries::metrics::{Counter, RunMetrics};
use ironseries::postprocess::{Postprocessor, VectorTransform, postprocessor};
use ironseries::record::Value;
use ironseries::sample::{FeatureValue, Sample, SampleStream};
use ironseries::testing::{HOUR_MS, collect_ok};
use ironseries::window::Cadence;

fn n(x: f64) -> FeatureValue {
    FeatureValue::from(x)
}

fn null() -> FeatureValue {
    FeatureValue::Scalar(Value::Null)
}

fn seq(xs: &[f64]) -> FeatureValue {
    FeatureValue::Sequence(xs.iter().map(|x| Value::Number(*x)).collect())
}

fn sample(hour: i64, features: Vec<(&str, FeatureValue)>) -> Sample {
    let mut s = Sample::new(hour * HOUR_MS);
    s.features = features.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    s
}

/// Three samples over ids `a`, `b__x`, `b__y` and the sequence `w`.
fn fixture() -> Vec<Sample> {
    vec![
        sample(0, vec![("a", n(1.0)), ("b__x", n(2.0)), ("b__y", n(4.0)), ("w", seq(&[1.0, 2.0, 3.0]))]),
        sample(1, vec![("a", null()), ("b__y", n(6.0)), ("w", seq(&[1.0]))]),
        sample(2, vec![("a", n(3.0)), ("b__y", n(8.0))]),
    ]
}

fn profiled() -> (VectorProfiler, SchemaArtifact) {
    let mut profiler = VectorProfiler::new();
    fixture().iter().for_each(|s| profiler.observe(s));
    let schema = profiler.schema();
    (profiler, schema)
}

fn transforms(json: &str) -> Result<Vec<VectorTransform>> {
    Ok(serde_json::from_str(json)?)
}

fn run(pp: Postprocessor) -> Result<Vec<Sample>> {
    let input: SampleStream = Box::new(fixture().into_iter().map(Ok));
    collect_ok(pp.apply(input))
}

#[test]
fn schema_profiles_kinds_and_cadence() {
    let (_, schema) = profiled();
    let ids: Vec<_> = schema.features.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b__x", "b__y", "w"]);
    let w = &schema.features[3];
    assert_eq!(w.kind, EntryKind::Sequence);
    assert_eq!(w.cadence.as_ref().map(|c| c.target), Some(3));
    assert_eq!(schema.features[1].base_id, "b");
    assert_eq!(schema.counts.feature_vectors, 3);
}

#[test]
fn normalization_fills_in_the_schema_layout() -> Result<()> {
    let (_, schema) = profiled();
    let out = run(Postprocessor::new(&schema, None, &[], RunMetrics::new())?)?;
    assert_eq!(out.len(), 3);
    for s in &out {
        assert_eq!(s.features.len(), 4);
    }
    assert_eq!(out[2].features["b__x"], null());
    assert_eq!(out[1].features["w"], FeatureValue::Sequence(vec![Value::Number(1.0), Value::Null, Value::Null]));
    assert_eq!(out[2].features["w"], FeatureValue::Sequence(vec![Value::Null; 3]));
    Ok(())
}

#[test]
fn unknown_ids_are_removed() -> Result<()> {
    let (_, schema) = profiled();
    let mut pp = Postprocessor::new(&schema, None, &[], RunMetrics::new())?;
    let extra = sample(5, vec![("zzz", n(1.0))]);
    let out = pp.process(extra)?.expect("kept");
    assert!(!out.features.contains_key("zzz"));
    Ok(())
}

#[test]
fn horizontal_drop_uses_mean_coverage() -> Result<()> {
    let (_, schema) = profiled();
    let metrics = RunMetrics::new();
    let ts = transforms(r#"[{"kind": "drop", "axis": "horizontal", "threshold": 0.9}]"#)?;
    let out = run(Postprocessor::new(&schema, None, &ts, metrics.clone())?)?;
    assert_eq!(out.iter().map(|s| s.key).collect::<Vec<_>>(), vec![0]);
    assert_eq!(metrics.get(Counter::SamplesDropped), 2);
    Ok(())
}

#[test]
fn vertical_drop_prunes_weak_columns_from_metadata() -> Result<()> {
    let (profiler, schema) = profiled();
    let meta = profiler.metadata(WindowMode::Union, Cadence::HOUR, None);
    let ts = transforms(r#"[{"kind": "drop", "axis": "vertical", "threshold": 0.5}]"#)?;
    let out = run(Postprocessor::new(&schema, Some(&meta), &ts, RunMetrics::new())?)?;
    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|s| !s.features.contains_key("b__x")));
    assert!(out.iter().all(|s| s.features.contains_key("w")));
    Ok(())
}

#[test]
fn vertical_drop_needs_metadata() {
    let (_, schema) = profiled();
    let ts = transforms(r#"[{"kind": "drop", "axis": "vertical", "threshold": 0.5}]"#).expect("parse");
    let err = Postprocessor::new(&schema, None, &ts, RunMetrics::new()).err().expect("missing metadata");
    assert!(matches!(engine_error(&err), Some(EngineError::MissingArtifact(_))));
}

#[test]
fn drop_missing_requires_listed_ids() -> Result<()> {
    let (_, schema) = profiled();
    let ts = transforms(r#"[{"kind": "drop_missing", "required": ["a"], "min_coverage": 0.0}]"#)?;
    let out = run(Postprocessor::new(&schema, None, &ts, RunMetrics::new())?)?;
    assert_eq!(out.iter().map(|s| s.key / HOUR_MS).collect::<Vec<_>>(), vec![0, 2]);
    Ok(())
}

#[test]
fn history_fill_uses_prior_samples_only() -> Result<()> {
    let (_, schema) = profiled();
    let ts = transforms(r#"[{"kind": "fill", "statistic": "mean"}]"#)?;
    let out = run(Postprocessor::new(&schema, None, &ts, RunMetrics::new())?)?;
    assert_eq!(out[1].features["a"], n(1.0));
    // Nothing earlier to draw from for b__x in the first sample; the second sees 2.0.
    assert_eq!(out[1].features["b__x"], n(2.0));
    Ok(())
}

#[test]
fn fill_across_partitions_uses_siblings() -> Result<()> {
    let (_, schema) = profiled();
    let ts = transforms(r#"[{"kind": "fill_across_partitions", "statistic": "median"}]"#)?;
    let out = run(Postprocessor::new(&schema, None, &ts, RunMetrics::new())?)?;
    assert_eq!(out[1].features["b__x"], n(6.0));
    assert_eq!(out[2].features["b__x"], n(8.0));
    // No sibling for `a`.
    assert_eq!(out[1].features["a"], null());
    Ok(())
}

#[test]
fn replace_seeds_remaining_nulls() -> Result<()> {
    let (_, schema) = profiled();
    let ts = transforms(r#"[{"kind": "replace", "value": 0}]"#)?;
    let out = run(Postprocessor::new(&schema, None, &ts, RunMetrics::new())?)?;
    assert_eq!(out[1].features["a"], n(0.0));
    assert_eq!(out[2].features["w"], seq(&[0.0, 0.0, 0.0]));
    assert!(out.iter().all(|s| s.features.values().all(|v| !v.is_missing())));
    Ok(())
}

#[test]
fn target_payload_is_addressed_separately() -> Result<()> {
    let (_, schema) = profiled();
    // Targets have no schema ids here, so a target-only replace leaves features alone.
    let ts = transforms(r#"[{"kind": "replace", "value": 0, "payload": "targets"}]"#)?;
    let out = run(Postprocessor::new(&schema, None, &ts, RunMetrics::new())?)?;
    assert_eq!(out[1].features["a"], null());
    Ok(())
}

#[test]
fn transforms_without_schema_fail() {
    let err = postprocessor(None, None, &[], RunMetrics::new()).err().expect("missing schema");
    assert!(matches!(engine_error(&err), Some(EngineError::MissingArtifact(_))));
}
