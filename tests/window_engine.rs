use anyhow::Result;
use ironseries::engine::{StreamRule, apply_stream_rules};
use ironseries::error::EngineError;
use ironseries::metrics::{Counter, RunMetrics};
use ironseries::record::TemporalRecord;
use ironseries::testing::{HOUR_MS, RecordBuilder, collect_ok, hourly_records, stream_of};

fn rules(json: &str) -> Result<Vec<StreamRule>> {
    Ok(serde_json::from_str(json)?)
}

fn values(out: &[TemporalRecord], field: &str) -> Vec<Option<f64>> {
    out.iter().map(|r| r.numeric(field)).collect()
}

#[test]
fn cadence_inserts_exactly_the_missing_ticks() -> Result<()> {
    let metrics = RunMetrics::new();
    let input = stream_of(vec![
        RecordBuilder::at(0).identity("station", "a").value(1.0).build(),
        RecordBuilder::at(3 * HOUR_MS).identity("station", "a").value(4.0).build(),
    ]);
    let out = collect_ok(apply_stream_rules(
        input,
        &["station".to_string()],
        &rules(r#"[{"kind": "ensure_cadence", "tick": "1h"}]"#)?,
        &metrics,
    ))?;
    let times: Vec<i64> = out.iter().map(|r| r.time / HOUR_MS).collect();
    assert_eq!(times, vec![0, 1, 2, 3]);
    assert_eq!(values(&out, "value"), vec![Some(1.0), None, None, Some(4.0)]);
    assert!(out[1].field("value").is_null());
    assert_eq!(out[1].identity, out[0].identity);
    assert_eq!(metrics.get(Counter::TicksInserted), 2);
    Ok(())
}

#[test]
fn cadence_state_resets_per_partition() -> Result<()> {
    let input = stream_of(vec![
        RecordBuilder::at(0).identity("s", "a").value(1.0).build(),
        RecordBuilder::at(5 * HOUR_MS).identity("s", "b").value(2.0).build(),
        RecordBuilder::at(6 * HOUR_MS).identity("s", "b").value(3.0).build(),
    ]);
    let out = collect_ok(apply_stream_rules(
        input,
        &["s".to_string()],
        &rules(r#"[{"kind": "ensure_cadence", "tick": "1h"}]"#)?,
        &RunMetrics::new(),
    ))?;
    assert_eq!(out.len(), 3);
    Ok(())
}

#[test]
fn dedupe_drops_identical_neighbours() -> Result<()> {
    let metrics = RunMetrics::new();
    let rec = RecordBuilder::at(0).value(1.0).build();
    let input = stream_of(vec![rec.clone(), rec.clone(), RecordBuilder::at(0).value(2.0).build(), rec]);
    let out = collect_ok(apply_stream_rules(input, &[], &rules(r#"[{"kind": "dedupe"}]"#)?, &metrics))?;
    assert_eq!(values(&out, "value"), vec![Some(1.0), Some(2.0), Some(1.0)]);
    assert_eq!(metrics.get(Counter::DuplicatesDropped), 1);
    Ok(())
}

#[test]
fn granularity_collapses_equal_timestamps() -> Result<()> {
    let input = || {
        stream_of(vec![
            RecordBuilder::at(0).value(1.0).build(),
            RecordBuilder::at(0).value(3.0).build(),
            RecordBuilder::at(HOUR_MS).value(5.0).build(),
        ])
    };
    let metrics = RunMetrics::new();
    let first = collect_ok(apply_stream_rules(input(), &[], &rules(r#"[{"kind": "granularity"}]"#)?, &metrics))?;
    assert_eq!(values(&first, "value"), vec![Some(1.0), Some(5.0)]);
    assert_eq!(metrics.get(Counter::RecordsAggregated), 1);

    let mean = collect_ok(apply_stream_rules(
        input(),
        &[],
        &rules(r#"[{"kind": "granularity", "mode": "mean"}]"#)?,
        &RunMetrics::new(),
    ))?;
    assert_eq!(values(&mean, "value"), vec![Some(2.0), Some(5.0)]);
    Ok(())
}

#[test]
fn fill_uses_recent_history_and_respects_min_samples() -> Result<()> {
    let metrics = RunMetrics::new();
    let out = collect_ok(apply_stream_rules(
        hourly_records(0, &[f64::NAN, 1.0, 3.0, f64::NAN, 10.0, f64::NAN]),
        &[],
        &rules(r#"[{"kind": "fill", "statistic": "mean", "window": 2, "min_samples": 2}]"#)?,
        &metrics,
    ))?;
    // The leading null has no history; the others average the last two values.
    assert_eq!(values(&out, "value"), vec![None, Some(1.0), Some(3.0), Some(2.0), Some(10.0), Some(6.5)]);
    assert_eq!(metrics.get(Counter::ValuesFilled), 2);
    Ok(())
}

#[test]
fn rolling_writes_trailing_statistic() -> Result<()> {
    let out = collect_ok(apply_stream_rules(
        hourly_records(0, &[1.0, 2.0, 3.0, 4.0]),
        &[],
        &rules(r#"[{"kind": "rolling", "to": "avg", "statistic": "mean", "window": 2}]"#)?,
        &RunMetrics::new(),
    ))?;
    assert_eq!(values(&out, "avg"), vec![None, Some(1.5), Some(2.5), Some(3.5)]);
    assert_eq!(values(&out, "value"), vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
    Ok(())
}

#[test]
fn unordered_input_is_an_ordering_error() -> Result<()> {
    let input = stream_of(vec![RecordBuilder::at(HOUR_MS).build(), RecordBuilder::at(0).build()]);
    let out: Vec<_> = apply_stream_rules(input, &[], &rules(r#"[{"kind": "dedupe"}]"#)?, &RunMetrics::new()).collect();
    let err = out.into_iter().find_map(Result::err).expect("ordering error");
    assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Ordering { stage: "dedupe", .. })));
    Ok(())
}
