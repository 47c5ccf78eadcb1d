//! Vector assembler.
//!
//! K-way merge of per-feature event streams, keyed by `(bucket, input index)`.
//! Every input is already ordered by `(bucket, feature_id, time)`, so popping
//! the heap until the bucket changes yields all events of one bucket, which
//! become one [`Sample`].
//!
//! A feature id with a single scalar event in a bucket becomes a scalar;
//! several events, or any sequence window, become a list in arrival order.
//!
//! In rectangular mode every bucket of a declared window is emitted, with
//! empty maps where nothing contributed. Events before the window are dropped
//! and counted; events after it are never pulled.

use crate::error::EngineError;
use crate::feature::{EventPayload, EventStream, FeatureEvent};
use crate::metrics::{Counter, RunMetrics};
use crate::record::Value;
use crate::sample::{FeatureValue, Payload, Sample};
use crate::window::{Cadence, TimestampMs, Window, format_timestamp};
use anyhow::{Context, Result};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

/// One event stream and the half of the sample it feeds.
pub struct AssemblerInput {
    pub name: String,
    pub role: Payload,
    pub events: EventStream,
}

impl AssemblerInput {
    pub fn new(name: impl Into<String>, role: Payload, events: EventStream) -> Self {
        Self { name: name.into(), role, events }
    }
}

struct Head {
    bucket: TimestampMs,
    input: usize,
    event: FeatureEvent,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Head {}
impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bucket.cmp(&other.bucket).then(self.input.cmp(&other.input))
    }
}

type EventKey = (TimestampMs, String, TimestampMs);

struct Cursor {
    input: AssemblerInput,
    last: Option<EventKey>,
}

impl Cursor {
    fn pull(&mut self, index: usize) -> Result<Option<Head>> {
        let Some(next) = self.input.events.next() else {
            return Ok(None);
        };
        let event = next.with_context(|| format!("feature stream `{}`", self.input.name))?;
        let key = (event.bucket, event.feature_id.clone(), event.time);
        if let Some(last) = &self.last
            && key < *last
        {
            return Err(EngineError::ordering(
                "assembler",
                format!("stream `{}` went back to {} after {}", self.input.name, format_timestamp(key.0), format_timestamp(last.0)),
            )
            .into());
        }
        self.last = Some(key);
        Ok(Some(Head { bucket: event.bucket, input: index, event }))
    }
}

#[derive(Clone, Copy)]
struct Rectangle {
    next: TimestampMs,
    end: TimestampMs,
    step: i64,
}

#[derive(Default)]
struct Cell {
    values: Vec<Value>,
    sequence: bool,
}

impl Cell {
    fn push(&mut self, payload: EventPayload) {
        match payload {
            EventPayload::Scalar(v) => self.values.push(v),
            EventPayload::Window(w) => {
                self.sequence = true;
                self.values.extend(w.values());
            }
        }
    }

    fn finish(mut self) -> FeatureValue {
        if !self.sequence && self.values.len() == 1 {
            FeatureValue::Scalar(self.values.pop().unwrap_or_default())
        } else {
            FeatureValue::Sequence(self.values)
        }
    }
}

/// Iterator of assembled samples in ascending bucket order.
pub struct VectorAssembler {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<Reverse<Head>>,
    primed: bool,
    rectangle: Option<Rectangle>,
    metrics: RunMetrics,
    done: bool,
}

impl VectorAssembler {
    pub fn new(inputs: Vec<AssemblerInput>, metrics: RunMetrics) -> Self {
        Self {
            cursors: inputs.into_iter().map(|input| Cursor { input, last: None }).collect(),
            heap: BinaryHeap::new(),
            primed: false,
            rectangle: None,
            metrics,
            done: false,
        }
    }

    /// Emit every `group_by` bucket of `window`, filled or not.
    #[must_use]
    pub fn rectangular(mut self, window: Window, group_by: Cadence) -> Self {
        self.rectangle = Some(Rectangle {
            next: group_by.floor(window.start),
            end: window.end,
            step: group_by.as_millis(),
        });
        self
    }

    fn prime(&mut self) -> Result<()> {
        for (i, c) in self.cursors.iter_mut().enumerate() {
            if let Some(head) = c.pull(i)? {
                self.heap.push(Reverse(head));
            }
        }
        self.primed = true;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<Head>> {
        let Some(Reverse(head)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.cursors[head.input].pull(head.input)? {
            self.heap.push(Reverse(next));
        }
        Ok(Some(head))
    }

    fn peek_bucket(&self) -> Option<TimestampMs> {
        self.heap.peek().map(|Reverse(h)| h.bucket)
    }

    fn take_bucket(&mut self, bucket: TimestampMs) -> Result<Sample> {
        let mut cells: [BTreeMap<String, Cell>; 2] = [BTreeMap::new(), BTreeMap::new()];
        while self.peek_bucket() == Some(bucket) {
            let Some(head) = self.pop()? else {
                break;
            };
            let slot = match self.cursors[head.input].input.role {
                Payload::Features => 0,
                Payload::Targets => 1,
            };
            cells[slot].entry(head.event.feature_id).or_default().push(head.event.payload);
        }
        let [features, targets] = cells;
        let mut sample = Sample::new(bucket);
        sample.features = features.into_iter().map(|(id, c)| (id, c.finish())).collect();
        sample.targets = targets.into_iter().map(|(id, c)| (id, c.finish())).collect();
        self.metrics.increment(Counter::SamplesAssembled, 1);
        Ok(sample)
    }

    fn step(&mut self) -> Result<Option<Sample>> {
        if !self.primed {
            self.prime()?;
        }
        let Some(rect) = self.rectangle else {
            return match self.peek_bucket() {
                Some(bucket) => self.take_bucket(bucket).map(Some),
                None => Ok(None),
            };
        };
        if rect.next >= rect.end {
            return Ok(None);
        }
        while self.peek_bucket().is_some_and(|b| b < rect.next) {
            self.pop()?;
            self.metrics.increment(Counter::EventsOutOfWindow, 1);
        }
        let sample = self.take_bucket(rect.next)?;
        self.rectangle = Some(Rectangle { next: rect.next + rect.step, ..rect });
        Ok(Some(sample))
    }
}

impl Iterator for VectorAssembler {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(s)) => Some(Ok(s)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
