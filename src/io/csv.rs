//! Flattened CSV sample sink.
//!
//! Columns are `key`, then one column per feature id, then one per target id
//! (prefixed `target:`), then `split` when any sample carries a label. Column
//! order follows the schema artifact. Scalars are written as text, nulls as an
//! empty cell, and sequences as a JSON array in a single cell.

use crate::artifacts::SchemaArtifact;
use crate::io::ensure_parent;
use crate::record::Value;
use crate::sample::{FeatureValue, Payload, Sample};
use crate::window::format_timestamp;
use anyhow::{Context, Result};
use csv::WriterBuilder;
use std::fs::File;
use std::path::Path;

const TARGET_PREFIX: &str = "target:";

fn cell(v: Option<&FeatureValue>) -> Result<String> {
    Ok(match v {
        None | Some(FeatureValue::Scalar(Value::Null)) => String::new(),
        Some(FeatureValue::Scalar(v)) => v.to_string(),
        Some(seq @ FeatureValue::Sequence(_)) => serde_json::to_string(seq).context("encode sequence cell")?,
    })
}

/// Write samples as CSV with the columns of `schema`.
///
/// `with_split` adds a trailing `split` column; leave it off unless the split
/// runs in tag mode.
///
/// # Errors
/// File creation, the first stream error, or a CSV write failure.
pub fn write_samples_csv<I>(path: impl AsRef<Path>, schema: &SchemaArtifact, with_split: bool, samples: I) -> Result<usize>
where
    I: IntoIterator<Item = Result<Sample>>,
{
    let path = path.as_ref();
    ensure_parent(path)?;
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = WriterBuilder::new().has_headers(false).from_writer(f);

    let features = schema.ids(Payload::Features);
    let targets = schema.ids(Payload::Targets);
    let mut header = Vec::with_capacity(features.len() + targets.len() + 2);
    header.push("key".to_string());
    header.extend(features.iter().cloned());
    header.extend(targets.iter().map(|t| format!("{TARGET_PREFIX}{t}")));
    if with_split {
        header.push("split".to_string());
    }
    w.write_record(&header).context("write CSV header")?;

    let mut n = 0usize;
    for sample in samples {
        let sample = sample?;
        let mut row = Vec::with_capacity(header.len());
        row.push(format_timestamp(sample.key));
        for id in &features {
            row.push(cell(sample.features.get(id))?);
        }
        for id in &targets {
            row.push(cell(sample.targets.get(id))?);
        }
        if with_split {
            row.push(sample.split.clone().unwrap_or_default());
        }
        w.write_record(&row).with_context(|| format!("write CSV row #{}", n + 1))?;
        n += 1;
    }
    w.flush().with_context(|| format!("flush {}", path.display()))?;
    Ok(n)
}
