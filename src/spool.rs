//! Length-prefixed spool files.
//!
//! A spool is an anonymous temporary file holding a sequence of frames, each a
//! little-endian `u64` length followed by a `postcard` payload. Spools back the
//! fan-out buffer (random access by offset) and the external sort runs
//! (sequential read back). The file is unlinked on creation and disappears when
//! the handle drops, on every exit path.

use crate::error::EngineError;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;

const LEN_PREFIX: u64 = 8;

/// Append-only spool of `T` frames with random reads.
pub struct SpoolFile<T> {
    file: File,
    bytes: u64,
    frames: u64,
    _t: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> SpoolFile<T> {
    /// Create a spool in the system temp directory.
    ///
    /// # Errors
    /// Fails with a resource error when the temp file cannot be created.
    pub fn new() -> Result<Self> {
        let file = tempfile::tempfile()
            .map_err(|e| EngineError::Resource(format!("cannot create spool file: {e}")))?;
        Ok(Self::from_file(file))
    }

    /// Create a spool under `dir`.
    ///
    /// # Errors
    /// Fails with a resource error when the temp file cannot be created.
    pub fn new_in(dir: &Path) -> Result<Self> {
        let file = tempfile::tempfile_in(dir).map_err(|e| {
            EngineError::Resource(format!("cannot create spool file in {}: {e}", dir.display()))
        })?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: File) -> Self {
        Self { file, bytes: 0, frames: 0, _t: PhantomData }
    }

    /// Append one frame; returns its offset.
    ///
    /// # Errors
    /// Serialization and write failures are resource errors.
    pub fn append(&mut self, item: &T) -> Result<u64> {
        let payload = encode(item)?;
        let offset = self.bytes;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&(payload.len() as u64).to_le_bytes()))
            .and_then(|()| self.file.write_all(&payload))
            .map_err(|e| EngineError::Resource(format!("spool write failed: {e}")))?;
        self.bytes += LEN_PREFIX + payload.len() as u64;
        self.frames += 1;
        Ok(offset)
    }

    /// Append many frames through one buffered writer.
    ///
    /// # Errors
    /// Serialization and write failures are resource errors.
    pub fn extend<'a, I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        self.file
            .seek(SeekFrom::Start(self.bytes))
            .map_err(|e| EngineError::Resource(format!("spool seek failed: {e}")))?;
        let mut w = BufWriter::new(&mut self.file);
        for item in items {
            let payload = encode(item)?;
            w.write_all(&(payload.len() as u64).to_le_bytes())
                .and_then(|()| w.write_all(&payload))
                .map_err(|e| EngineError::Resource(format!("spool write failed: {e}")))?;
            self.bytes += LEN_PREFIX + payload.len() as u64;
            self.frames += 1;
        }
        w.flush()
            .map_err(|e| EngineError::Resource(format!("spool flush failed: {e}")))?;
        Ok(())
    }

    /// Read the frame at `offset`; returns the item and the next frame's offset.
    ///
    /// # Errors
    /// Fails on short reads or undecodable payloads.
    pub fn read_at(&mut self, offset: u64) -> Result<(T, u64)> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| EngineError::Resource(format!("spool seek failed: {e}")))?;
        let item = read_frame(&mut self.file)?
            .with_context(|| format!("spool frame at offset {offset} is missing"))?;
        let next = self.file.stream_position().context("spool position")?;
        Ok((item.0, next))
    }

    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consume the spool into a sequential reader from the first frame.
    ///
    /// # Errors
    /// Fails when the file cannot be rewound.
    pub fn into_reader(mut self) -> Result<SpoolReader<T>> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| EngineError::Resource(format!("spool rewind failed: {e}")))?;
        Ok(SpoolReader { reader: BufReader::new(self.file), remaining: self.frames, _t: PhantomData })
    }
}

/// Sequential reader over a finished spool.
pub struct SpoolReader<T> {
    reader: BufReader<File>,
    remaining: u64,
    _t: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for SpoolReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match read_frame(&mut self.reader) {
            Ok(Some((item, _))) => Some(Ok(item)),
            Ok(None) => {
                self.remaining = 0;
                Some(Err(EngineError::Resource("spool ended before its last frame".into()).into()))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

fn encode<T: Serialize>(item: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(item).map_err(|e| {
        EngineError::Resource(format!("record cannot be serialized for spooling: {e}")).into()
    })
}

/// Read one frame; `Ok(None)` on a clean end of file.
fn read_frame<T: DeserializeOwned, R: Read>(r: &mut R) -> Result<Option<(T, u64)>> {
    let mut len = [0u8; LEN_PREFIX as usize];
    match r.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(EngineError::Resource(format!("spool read failed: {e}")).into()),
    }
    let n = u64::from_le_bytes(len);
    let mut buf = vec![0u8; usize::try_from(n).context("spool frame too large")?];
    r.read_exact(&mut buf)
        .map_err(|e| EngineError::Resource(format!("truncated spool frame: {e}")))?;
    let item = postcard::from_bytes(&buf)
        .map_err(|e| EngineError::Resource(format!("corrupt spool frame: {e}")))?;
    Ok(Some((item, LEN_PREFIX + n)))
}
