use anyhow::Result;
use ironseries::assembler::{AssemblerInput, VectorAssembler};
use ironseries::feature::{EventPayload, EventStream, FeatureEvent, SequenceWindow};
use ironseries::metrics::{Counter, RunMetrics};
use ironseries::record::{TemporalRecord, Value};
use ironseries::sample::{FeatureValue, Payload};
use ironseries::testing::{HOUR_MS, collect_ok};
use ironseries::window::{Cadence, Window};

fn scalar_events(id: &str, hours: &[i64]) -> EventStream {
    let events: Vec<_> = hours
        .iter()
        .map(|h| {
            Ok(FeatureEvent {
                feature_id: id.to_string(),
                time: h * HOUR_MS,
                bucket: h * HOUR_MS,
                payload: EventPayload::Scalar(Value::Number(*h as f64)),
            })
        })
        .collect();
    Box::new(events.into_iter())
}

#[test]
fn one_sample_per_bucket_from_features_and_targets() -> Result<()> {
    let inputs = vec![
        AssemblerInput::new("a", Payload::Features, scalar_events("a", &[0, 1, 3])),
        AssemblerInput::new("b", Payload::Features, scalar_events("b", &[1, 2])),
        AssemblerInput::new("y", Payload::Targets, scalar_events("y", &[0, 3])),
    ];
    let samples = collect_ok(VectorAssembler::new(inputs, RunMetrics::new()))?;
    let keys: Vec<_> = samples.iter().map(|s| s.key / HOUR_MS).collect();
    assert_eq!(keys, vec![0, 1, 2, 3]);
    assert_eq!(samples[1].features.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert!(samples[1].targets.is_empty());
    assert_eq!(samples[3].targets.get("y"), Some(&FeatureValue::from(3.0)));
    Ok(())
}

#[test]
fn several_events_in_a_bucket_become_a_sequence() -> Result<()> {
    let events: Vec<_> = [0, 20, 40]
        .iter()
        .map(|m| {
            Ok(FeatureEvent {
                feature_id: "x".to_string(),
                time: m * 60_000,
                bucket: 0,
                payload: EventPayload::Scalar(Value::Number(*m as f64)),
            })
        })
        .collect();
    let inputs = vec![AssemblerInput::new("x", Payload::Features, Box::new(events.into_iter()))];
    let samples = collect_ok(VectorAssembler::new(inputs, RunMetrics::new()))?;
    assert_eq!(samples.len(), 1);
    assert_eq!(
        samples[0].features["x"],
        FeatureValue::Sequence(vec![Value::Number(0.0), Value::Number(20.0), Value::Number(40.0)])
    );
    Ok(())
}

#[test]
fn a_window_event_is_always_a_sequence() -> Result<()> {
    let window = SequenceWindow {
        size: 1,
        stride: 1,
        cadence: None,
        records: vec![TemporalRecord::new(0).with_field("value", 7.0)],
    };
    let ev = FeatureEvent { feature_id: "w".to_string(), time: 0, bucket: 0, payload: EventPayload::Window(window) };
    let inputs = vec![AssemblerInput::new("w", Payload::Features, Box::new(std::iter::once(Ok(ev))))];
    let samples = collect_ok(VectorAssembler::new(inputs, RunMetrics::new()))?;
    assert!(samples[0].features["w"].is_sequence());
    Ok(())
}

#[test]
fn rectangular_mode_emits_every_bucket() -> Result<()> {
    let metrics = RunMetrics::new();
    // 100 buckets, every tenth one empty; one event before and one after the window.
    let hours: Vec<i64> = std::iter::once(-1).chain((0..100).filter(|h| h % 10 != 5)).chain(std::iter::once(100)).collect();
    let inputs = vec![AssemblerInput::new("x", Payload::Features, scalar_events("x", &hours))];
    let window = Window::new(0, 100 * HOUR_MS);
    let samples = collect_ok(VectorAssembler::new(inputs, metrics.clone()).rectangular(window, Cadence::HOUR))?;
    assert_eq!(samples.len(), 100);
    assert_eq!(samples.iter().filter(|s| s.is_empty()).count(), 10);
    assert_eq!(samples.first().map(|s| s.key), Some(0));
    assert_eq!(samples.last().map(|s| s.key), Some(99 * HOUR_MS));
    assert_eq!(metrics.get(Counter::EventsOutOfWindow), 1);
    Ok(())
}

#[test]
fn backwards_input_is_an_ordering_error() {
    let inputs = vec![AssemblerInput::new("x", Payload::Features, scalar_events("x", &[2, 1]))];
    let out: Vec<_> = VectorAssembler::new(inputs, RunMetrics::new()).collect();
    assert!(out.iter().any(Result::is_err));
}
