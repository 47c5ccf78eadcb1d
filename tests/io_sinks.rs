use anyhow::Result;
use ironseries::artifacts::VectorProfiler;
use ironseries::error::{EngineError, engine_error};
use ironseries::record::Value;
use ironseries::sample::{FeatureValue, Sample};
use ironseries::testing::HOUR_MS;
use ironseries::{read_samples_jsonl, write_samples_csv, write_samples_jsonl};

fn samples() -> Vec<Sample> {
    let mut a = Sample::new(0);
    a.features.insert("temp".into(), FeatureValue::from(4.5));
    a.features.insert("wind".into(), FeatureValue::Sequence(vec![Value::Number(1.0), Value::Null]));
    a.targets.insert("rain".into(), FeatureValue::from(0.0));
    a.split = Some("train".into());

    let mut b = Sample::new(HOUR_MS);
    b.features.insert("temp".into(), FeatureValue::Scalar(Value::Null));
    b.features.insert("wind".into(), FeatureValue::Sequence(vec![Value::Number(3.0), Value::Number(4.0)]));
    b.targets.insert("rain".into(), FeatureValue::from(1.0));
    b.split = Some("test".into());
    vec![a, b]
}

#[test]
fn jsonl_round_trips_and_uses_rfc3339_keys() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out/samples.jsonl");
    let n = write_samples_jsonl(&path, samples().into_iter().map(Ok))?;
    assert_eq!(n, 2);
    let text = std::fs::read_to_string(&path)?;
    assert!(text.lines().next().is_some_and(|l| l.contains(r#""key":"1970-01-01T00:00:00Z""#)));
    assert_eq!(read_samples_jsonl(&path)?, samples());
    Ok(())
}

#[test]
fn sink_returns_the_stream_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let items: Vec<Result<Sample>> = vec![Ok(Sample::new(0)), Err(EngineError::Cancelled.into())];
    let err = write_samples_jsonl(dir.path().join("x.jsonl"), items).err().expect("stream error");
    assert!(matches!(engine_error(&err), Some(EngineError::Cancelled)));
    Ok(())
}

#[test]
fn csv_follows_the_schema_columns() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut profiler = VectorProfiler::new();
    samples().iter().for_each(|s| profiler.observe(s));
    let schema = profiler.schema();

    let path = dir.path().join("samples.csv");
    let n = write_samples_csv(&path, &schema, true, samples().into_iter().map(Ok))?;
    assert_eq!(n, 2);
    let text = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "key,temp,wind,target:rain,split");
    assert_eq!(lines[1], r#"1970-01-01T00:00:00Z,4.5,"[1.0,null]",0,train"#);
    assert_eq!(lines[2], r#"1970-01-01T01:00:00Z,,"[3.0,4.0]",1,test"#);
    Ok(())
}
