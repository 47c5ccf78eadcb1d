use anyhow::Result;
use ironseries::compose::{AlignedRow, Aligner, ComposeFn, difference, mean, sum};
use ironseries::error::{EngineError, engine_error};
use ironseries::metrics::{Counter, RunMetrics};
use ironseries::record::{RecordStream, TemporalRecord};
use ironseries::testing::{HOUR_MS, RecordBuilder, collect_ok, stream_of};
use serde_json::json;
use std::sync::Arc;

fn at_hours(pairs: &[(i64, f64)]) -> RecordStream {
    stream_of(pairs.iter().map(|(h, v)| RecordBuilder::at(h * HOUR_MS).value(*v).build()).collect())
}

fn aligner(inputs: Vec<(&str, RecordStream)>, f: Arc<dyn ComposeFn>, metrics: &RunMetrics) -> Result<Aligner> {
    Aligner::new(
        "derived",
        inputs.into_iter().map(|(a, s)| (a.to_string(), s)).collect(),
        None,
        Vec::new(),
        f,
        json!({}),
        metrics.clone(),
    )
}

#[test]
fn only_matching_keys_compose() -> Result<()> {
    let metrics = RunMetrics::new();
    let a = at_hours(&[(1, 1.0), (2, 2.0)]);
    let b = at_hours(&[(1, 10.0), (3, 30.0)]);
    let out = collect_ok(aligner(vec![("a", a), ("b", b)], sum(), &metrics)?)?;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].time, HOUR_MS);
    assert_eq!(out[0].numeric("value"), Some(11.0));
    assert_eq!(metrics.get(Counter::RowsUnmatched), 1);
    Ok(())
}

#[test]
fn builtin_reductions() -> Result<()> {
    let run = |f: Arc<dyn ComposeFn>| -> Result<Option<f64>> {
        let a = at_hours(&[(0, 9.0)]);
        let b = at_hours(&[(0, 3.0)]);
        let out = collect_ok(aligner(vec![("a", a), ("b", b)], f, &RunMetrics::new())?)?;
        Ok(out[0].numeric("value"))
    };
    assert_eq!(run(sum())?, Some(12.0));
    assert_eq!(run(mean())?, Some(6.0));
    assert_eq!(run(difference())?, Some(6.0));
    Ok(())
}

#[test]
fn optional_inputs_allow_partial_rows() -> Result<()> {
    let metrics = RunMetrics::new();
    let a = at_hours(&[(1, 1.0), (2, 2.0)]);
    let b = at_hours(&[(1, 10.0)]);
    let required = vec!["a".to_string()];
    let f = |row: &AlignedRow, _: &serde_json::Value| -> Result<Option<TemporalRecord>> {
        let present = row.inputs.iter().filter(|(_, r)| r.is_some()).count();
        Ok(Some(row.template().with_field("present", present as f64)))
    };
    let aligner = Aligner::new(
        "derived",
        vec![("a".to_string(), a), ("b".to_string(), b)],
        Some(&required),
        Vec::new(),
        Arc::new(f),
        json!({}),
        metrics.clone(),
    )?;
    let out = collect_ok(aligner)?;
    let present: Vec<_> = out.iter().map(|r| r.numeric("present")).collect();
    assert_eq!(present, vec![Some(2.0), Some(1.0)]);
    assert_eq!(metrics.get(Counter::RowsUnmatched), 0);
    Ok(())
}

#[test]
fn duplicate_keys_are_an_ordering_error() -> Result<()> {
    let a = at_hours(&[(1, 1.0), (1, 2.0)]);
    let b = at_hours(&[(1, 10.0)]);
    let out: Vec<_> = aligner(vec![("a", a), ("b", b)], sum(), &RunMetrics::new())?.collect();
    let err = out.into_iter().find_map(Result::err).expect("duplicate key error");
    assert!(matches!(engine_error(&err), Some(EngineError::Ordering { stage: "compose", .. })));
    Ok(())
}

#[test]
fn unknown_required_alias_is_a_config_error() {
    let required = vec!["zzz".to_string()];
    let err = Aligner::new(
        "derived",
        vec![("a".to_string(), at_hours(&[]))],
        Some(&required),
        Vec::new(),
        sum(),
        json!({}),
        RunMetrics::new(),
    )
    .err()
    .expect("config error");
    assert!(matches!(engine_error(&err), Some(EngineError::Config { .. })));
}
