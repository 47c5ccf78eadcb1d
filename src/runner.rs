//! Execution mode, cancellation, and worker-thread prefetching.
//!
//! Every stage is a lazy iterator pulled by the next one. In
//! [`ExecMode::Parallel`] each feature/target event stream is driven on its own
//! worker thread that feeds a bounded channel ([`Prefetch`]); the assembler
//! stays the single consumer, so output order is identical in both modes.

use crate::error::EngineError;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};
use tracing::debug;

pub const DEFAULT_PREFETCH: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecMode {
    Sequential,
    /// Drive independent feature streams on worker threads, buffering up to
    /// `prefetch` items per stream.
    Parallel { prefetch: usize },
}

impl Default for ExecMode {
    fn default() -> Self {
        Self::Parallel { prefetch: DEFAULT_PREFETCH }
    }
}

impl ExecMode {
    #[must_use]
    pub const fn is_parallel(self) -> bool {
        matches!(self, Self::Parallel { .. })
    }
}

/* ===================== Cancellation ===================== */

/// Run-level cancellation signal, shared by every stage of a run.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// # Errors
    /// Returns [`EngineError::Cancelled`] once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// Iterator adapter that observes a [`CancellationToken`] on every pull.
///
/// After cancellation it yields one `Cancelled` error and then ends, dropping
/// the upstream iterator (and any spool handles it owns).
pub struct Cancellable<I> {
    inner: Option<I>,
    token: CancellationToken,
}

impl<I> Cancellable<I> {
    pub const fn new(inner: I, token: CancellationToken) -> Self {
        Self { inner: Some(inner), token }
    }
}

impl<T, I: Iterator<Item = Result<T>>> Iterator for Cancellable<I> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        if self.token.is_cancelled() {
            self.inner = None;
            return Some(Err(EngineError::Cancelled.into()));
        }
        let item = inner.next();
        if matches!(item, None | Some(Err(_))) {
            self.inner = None;
        }
        item
    }
}

/* ===================== Prefetch ===================== */

/// Drives an iterator on a worker thread and hands its items over a bounded channel.
///
/// Dropping the `Prefetch` disconnects the channel; the worker notices on its
/// next send and exits.
pub struct Prefetch<T> {
    rx: Option<Receiver<Result<T>>>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl<T: Send + 'static> Prefetch<T> {
    /// # Errors
    /// Fails when the worker thread cannot be spawned.
    pub fn spawn<I>(name: impl Into<String>, iter: I, capacity: usize) -> Result<Self>
    where
        I: Iterator<Item = Result<T>> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = sync_channel(capacity.max(1));
        let handle = thread::Builder::new()
            .name(format!("ironseries-{name}"))
            .spawn(move || drive(iter, &tx))
            .map_err(|e| EngineError::Resource(format!("cannot spawn worker for {name}: {e}")))?;
        debug!(stream = %name, capacity, "prefetch worker started");
        Ok(Self { rx: Some(rx), handle: Some(handle), name })
    }
}

fn drive<T, I: Iterator<Item = Result<T>>>(iter: I, tx: &SyncSender<Result<T>>) {
    for item in iter {
        let stop = item.is_err();
        if tx.send(item).is_err() || stop {
            return;
        }
    }
}

impl<T> Iterator for Prefetch<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let rx = self.rx.as_ref()?;
        if let Ok(item) = rx.recv() {
            return Some(item);
        }
        self.rx = None;
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(()) => None,
            Err(_) => Some(Err(anyhow!("worker for stream `{}` panicked", self.name))),
        }
    }
}

/// Wrap `iter` according to the execution mode.
///
/// # Errors
/// Fails when a worker thread cannot be spawned.
pub fn drive_with<T, I>(mode: ExecMode, name: &str, iter: I) -> Result<Box<dyn Iterator<Item = Result<T>> + Send>>
where
    T: Send + 'static,
    I: Iterator<Item = Result<T>> + Send + 'static,
{
    Ok(match mode {
        ExecMode::Sequential => Box::new(iter),
        ExecMode::Parallel { prefetch } => Box::new(Prefetch::spawn(name, iter, prefetch)?),
    })
}
