//! Per-request nested-span tree with a cap and rollup summary (spec §4.2).
//!
//! Lives in ordinary owned per-request state passed by the caller — no
//! thread-local storage (spec §9's explicit re-architecture note). The
//! host middleware is the single point that binds a fresh collector to a
//! request and tears it down on every exit path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One finalized segment: a sub-operation inside a request (SQL query, view
/// render, outbound call, custom span).
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub kind: String,
    pub duration_ms: f64,
    pub detail: String,
    /// Offset from request start, set once the collector is embedded into
    /// a sample's context.
    pub offset_ms: Option<f64>,
    pub source: Option<String>,
    /// Resolved index into the final segment list. `None` until
    /// `to_summary` assigns it (spans whose parent was evicted by the cap
    /// become orphans, matching the root-injection rule below).
    pub parent_index: Option<usize>,
    span_id: Option<u64>,
    parent_span_id: Option<u64>,
}

struct OpenSpanFrame {
    span_id: u64,
    kind: String,
    detail: String,
    start: Instant,
    parent_span_id: Option<u64>,
}

/// Payload handed to the `on_checkpoint` hook when the memory budget trips.
pub struct Checkpoint {
    pub segments: Vec<SegmentRecord>,
    pub summary: HashMap<String, f64>,
    pub checkpoint_number: u32,
}

/// Opaque handle returned by `push_span`; pass back to `pop_span`.
pub type SpanId = u64;

pub struct SegmentCollector {
    max_segments: usize,
    source_threshold: Duration,
    memory_limit: Option<usize>,

    segments: Vec<SegmentRecord>,
    summary: HashMap<String, f64>,
    open_stack: Vec<OpenSpanFrame>,
    next_span_id: u64,
    overflowed: bool,
    request_start: Instant,
    bytes_accumulated: usize,
    checkpoint_number: u32,
    on_checkpoint: Option<Box<dyn FnMut(Checkpoint) + Send>>,
}

impl SegmentCollector {
    pub fn new(max_segments: usize, source_threshold: Duration, memory_limit: Option<usize>) -> Self {
        Self {
            max_segments,
            source_threshold,
            memory_limit,
            segments: Vec::new(),
            summary: HashMap::new(),
            open_stack: Vec::new(),
            next_span_id: 0,
            overflowed: false,
            request_start: Instant::now(),
            bytes_accumulated: 0,
            checkpoint_number: 0,
            on_checkpoint: None,
        }
    }

    pub fn set_checkpoint_hook<F>(&mut self, f: F)
    where
        F: FnMut(Checkpoint) + Send + 'static,
    {
        self.on_checkpoint = Some(Box::new(f));
    }

    pub fn request_start(&self) -> Instant {
        self.request_start
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    fn current_parent_span_id(&self) -> Option<u64> {
        self.open_stack.last().map(|f| f.span_id)
    }

    /// Records an already-timed segment (no nesting participation of its
    /// own). `source` is included in the record only when `duration`
    /// exceeds `segment_source_threshold`, matching spec's "only when it
    /// matters" rule — the caller supplies it via `#[track_caller]` at
    /// essentially zero cost rather than this collector unwinding a stack.
    pub fn add(&mut self, kind: impl Into<String>, duration: Duration, detail: impl Into<String>, source: Option<String>) {
        let kind = kind.into();
        let detail = detail.into();
        self.bump_summary(&kind, duration);

        let source = if duration >= self.source_threshold { source } else { None };
        let record = SegmentRecord {
            kind,
            duration_ms: duration.as_secs_f64() * 1000.0,
            detail,
            offset_ms: None,
            source,
            parent_index: None,
            span_id: None,
            parent_span_id: self.current_parent_span_id(),
        };
        self.insert_or_replace(record);
        self.maybe_checkpoint();
    }

    /// Opens a nested span. Returns `None` at capacity — callers must
    /// tolerate `None` by falling back to timing the span themselves and
    /// calling `add` directly once it finishes (spec §4.2).
    pub fn push_span(&mut self, kind: impl Into<String>, detail: impl Into<String>) -> Option<SpanId> {
        if self.segments.len() >= self.max_segments {
            self.overflowed = true;
            return None;
        }
        let span_id = self.next_span_id;
        self.next_span_id += 1;
        self.open_stack.push(OpenSpanFrame {
            span_id,
            kind: kind.into(),
            detail: detail.into(),
            start: Instant::now(),
            parent_span_id: self.current_parent_span_id_excluding_self(),
        });
        Some(span_id)
    }

    fn current_parent_span_id_excluding_self(&self) -> Option<u64> {
        self.open_stack.last().map(|f| f.span_id)
    }

    /// Closes a span opened with `push_span`. Fills `duration` from
    /// `now - span_start` and folds totals into the summary. Idempotent:
    /// a span_id not found on the stack (already popped) is a no-op.
    pub fn pop_span(&mut self, span_id: SpanId) {
        let Some(pos) = self.open_stack.iter().position(|f| f.span_id == span_id) else {
            return;
        };
        // Nested children still open beneath an out-of-order pop are closed
        // too, in LIFO order, so the stack never holds dangling frames.
        let closing: Vec<OpenSpanFrame> = self.open_stack.split_off(pos);
        for frame in closing {
            let duration = frame.start.elapsed();
            self.bump_summary(&frame.kind, duration);
            let record = SegmentRecord {
                kind: frame.kind,
                duration_ms: duration.as_secs_f64() * 1000.0,
                detail: frame.detail,
                offset_ms: None,
                source: None,
                parent_index: None,
                span_id: Some(frame.span_id),
                parent_span_id: frame.parent_span_id,
            };
            self.insert_or_replace(record);
        }
        self.maybe_checkpoint();
    }

    fn bump_summary(&mut self, kind: &str, duration: Duration) {
        *self.summary.entry(format!("{kind}_count")).or_insert(0.0) += 1.0;
        *self.summary.entry(format!("{kind}_duration")).or_insert(0.0) += duration.as_secs_f64() * 1000.0;
    }

    /// Implements the capacity policy: below the cap, append; at the cap,
    /// replace the minimum-duration resident segment iff the incoming one
    /// is strictly greater. Summary counters are always updated by the
    /// caller before this is reached.
    fn insert_or_replace(&mut self, record: SegmentRecord) {
        self.bytes_accumulated += record.detail.len() + record.kind.len() + 64;

        if self.segments.len() < self.max_segments {
            self.segments.push(record);
            return;
        }
        self.overflowed = true;
        if let Some((min_idx, _)) = self
            .segments
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.duration_ms.partial_cmp(&b.1.duration_ms).unwrap())
        {
            if record.duration_ms > self.segments[min_idx].duration_ms {
                self.segments[min_idx] = record;
            }
        }
    }

    fn maybe_checkpoint(&mut self) {
        let Some(limit) = self.memory_limit else { return };
        if self.bytes_accumulated <= limit {
            return;
        }
        self.checkpoint_number += 1;
        let payload = Checkpoint {
            segments: std::mem::take(&mut self.segments),
            summary: std::mem::take(&mut self.summary),
            checkpoint_number: self.checkpoint_number,
        };
        self.bytes_accumulated = 0;
        if let Some(hook) = self.on_checkpoint.as_mut() {
            hook(payload);
        }
        // Open spans (span stack) survive the checkpoint untouched; the
        // summary continues accumulating from zero for the next window.
    }

    /// Resolves `parent_span_id` chains into `parent_index`es, and returns
    /// the finalized summary. Does not prepend the synthetic root segment
    /// — that is the caller's (Collector's) responsibility, since only it
    /// knows whether this is being embedded into a sample at all.
    pub fn to_summary(&self) -> (Vec<SegmentRecord>, HashMap<String, f64>) {
        let mut index_of: HashMap<u64, usize> = HashMap::new();
        for (i, s) in self.segments.iter().enumerate() {
            if let Some(id) = s.span_id {
                index_of.insert(id, i);
            }
        }
        let segments = self
            .segments
            .iter()
            .cloned()
            .map(|mut s| {
                s.parent_index = s.parent_span_id.and_then(|pid| index_of.get(&pid).copied());
                s
            })
            .collect();
        (segments, self.summary.clone())
    }

    pub fn segments(&self) -> &[SegmentRecord] {
        &self.segments
    }

    pub fn release(&mut self) {
        self.segments.clear();
        self.summary.clear();
        self.open_stack.clear();
        self.overflowed = false;
        self.bytes_accumulated = 0;
    }
}

/// Prepends a synthetic `request` root segment, shifting all existing
/// `parent_index`es by +1 and reparenting orphans onto the root (spec §4.2).
pub fn inject_root(mut segments: Vec<SegmentRecord>, root_duration_ms: f64) -> Vec<SegmentRecord> {
    for s in segments.iter_mut() {
        s.parent_index = match s.parent_index {
            Some(i) => Some(i + 1),
            None => Some(0),
        };
    }
    let root = SegmentRecord {
        kind: "request".to_string(),
        duration_ms: root_duration_ms,
        detail: String::new(),
        offset_ms: Some(0.0),
        source: None,
        parent_index: None,
        span_id: None,
        parent_span_id: None,
    };
    let mut out = Vec::with_capacity(segments.len() + 1);
    out.push(root);
    out.append(&mut segments);
    out
}
