//! JSON Lines sample sink and reader.
//!
//! One compact JSON sample per line. Feature and target maps are ordered, so
//! identical runs produce identical bytes.

use crate::io::ensure_parent;
use crate::sample::Sample;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Write samples to any writer, one per line.
///
/// # Errors
/// The first stream error, or a serialization / write failure.
pub fn write_samples<W, I>(mut w: W, samples: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = Result<Sample>>,
{
    let mut n = 0usize;
    for sample in samples {
        let sample = sample?;
        serde_json::to_writer(&mut w, &sample).with_context(|| format!("serialize sample #{}", n + 1))?;
        w.write_all(b"\n").context("write newline")?;
        n += 1;
    }
    w.flush().context("flush JSONL writer")?;
    Ok(n)
}

/// Write samples to a JSONL file, creating parent directories.
///
/// # Errors
/// File creation, the first stream error, or a serialization failure.
pub fn write_samples_jsonl<I>(path: impl AsRef<Path>, samples: I) -> Result<usize>
where
    I: IntoIterator<Item = Result<Sample>>,
{
    let path = path.as_ref();
    ensure_parent(path)?;
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    write_samples(BufWriter::new(f), samples).with_context(|| format!("write {}", path.display()))
}

/// Read a JSONL sample file back. Blank lines are skipped.
///
/// # Errors
/// I/O errors or a line that is not a sample, with its line number.
pub fn read_samples_jsonl(path: impl AsRef<Path>) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("read line {} in {}", i + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line).with_context(|| format!("parse sample on line {} in {}", i + 1, path.display()))?);
    }
    Ok(out)
}
