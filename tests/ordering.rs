use anyhow::Result;
use ironseries::error::EngineError;
use ironseries::metrics::{Counter, RunMetrics};
use ironseries::ordering::{OrderGuard, SortConfig, order_records};
use ironseries::record::TemporalRecord;
use ironseries::testing::{HOUR_MS, RecordBuilder, assert_non_decreasing, collect_ok};

// 100 records over two stations, times scrambled by a stride coprime with 100.
fn scrambled(n: i64) -> Vec<Result<TemporalRecord>> {
    (0..n)
        .map(|i| {
            let station = if i % 3 == 0 { "b" } else { "a" };
            Ok(RecordBuilder::at(((i * 37) % n) * HOUR_MS).identity("station", station).value(i as f64).build())
        })
        .collect()
}

fn key(r: &TemporalRecord) -> (String, i64) {
    (r.partition_key(&["station".to_string()]), r.time)
}

#[test]
fn output_is_sorted_for_any_batch_size() -> Result<()> {
    let n = 100;
    let mut outputs = Vec::new();
    for batch in [1, n as usize, n as usize + 1, 7] {
        let out = collect_ok(order_records(scrambled(n).into_iter(), vec!["station".into()], SortConfig::with_batch_size(batch)))?;
        assert_eq!(out.len(), n as usize);
        assert_non_decreasing(&out, key);
        outputs.push(out);
    }
    for other in &outputs[1..] {
        assert_eq!(other, &outputs[0]);
    }
    Ok(())
}

#[test]
fn ties_keep_arrival_order_across_runs() -> Result<()> {
    let input: Vec<Result<TemporalRecord>> =
        (0..10).map(|i| Ok(RecordBuilder::at((i % 2) * HOUR_MS).value(i as f64).build())).collect();
    let out = collect_ok(order_records(input.into_iter(), Vec::new(), SortConfig::with_batch_size(3)))?;
    let values: Vec<f64> = out.iter().filter_map(|r| r.numeric("value")).collect();
    assert_eq!(values, vec![0.0, 2.0, 4.0, 6.0, 8.0, 1.0, 3.0, 5.0, 7.0, 9.0]);
    Ok(())
}

#[test]
fn runs_beyond_memory_budget_spill_to_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let metrics = RunMetrics::new();
    let config = SortConfig {
        batch_size: 10,
        max_memory_runs: 2,
        parallel: true,
        spill_dir: Some(dir.path().to_path_buf()),
        metrics: Some(metrics.clone()),
    };
    let out = collect_ok(order_records(scrambled(100).into_iter(), vec!["station".into()], config))?;
    assert_eq!(out.len(), 100);
    assert_non_decreasing(&out, key);
    // Eight of the ten runs did not fit in memory.
    assert_eq!(metrics.get(Counter::RecordsSpooled), 80);
    Ok(())
}

#[test]
fn upstream_error_ends_the_stream() {
    let input = vec![Ok(TemporalRecord::new(0)), Err(anyhow::anyhow!("disk on fire"))];
    let mut out = order_records(input.into_iter(), Vec::new(), SortConfig::default());
    assert!(out.next().is_some_and(|r| r.is_err()));
    assert!(out.next().is_none());
}

#[test]
fn guard_rejects_time_going_backwards() {
    let input = [2, 1].map(|h| Ok::<_, anyhow::Error>(TemporalRecord::new(h * HOUR_MS)));
    let out: Vec<_> = OrderGuard::new(input.into_iter(), "test", |r: &TemporalRecord| r.time).collect();
    assert!(out[0].is_ok());
    let err = out[1].as_ref().err().unwrap();
    assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Ordering { stage: "test", .. })));
}
