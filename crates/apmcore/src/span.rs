//! User-facing instrumentation API (spec §4.8). Four shapes, all degrading
//! gracefully to standalone `custom`-kind events outside an active
//! `SegmentCollector`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::collector::{Collector, RequestOutcome};
use crate::event::{ErrorPayload, Kind};
use crate::segment::{Checkpoint, SegmentCollector, SpanId};

/// Captures a panic payload's message the way a caught exception's message
/// would read, without attempting to recover a backtrace (`std::panic`
/// does not expose one to the hook-free `catch_unwind` path).
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct SpanApi {
    collector: Arc<Collector>,
}

impl SpanApi {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }

    /// `Trace(name, metadata){block}`. Nests inside `segment_collector`
    /// when present; otherwise records a standalone `custom` event timing
    /// the block. Always records duration, even when `f` panics, then
    /// resumes the unwind so the caller's own error handling still runs.
    pub fn trace<F, R>(&self, segment_collector: Option<&mut SegmentCollector>, name: &str, detail: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        match segment_collector {
            Some(sc) => self.trace_nested(sc, name, detail, f),
            None => self.trace_standalone(name, detail, f),
        }
    }

    fn trace_nested<F, R>(&self, sc: &mut SegmentCollector, name: &str, detail: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let span_id = sc.push_span(name, detail);
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        match span_id {
            Some(id) => sc.pop_span(id),
            // At segment capacity: still record the timed span directly
            // rather than silently losing it (spec §4.2 fallback).
            None => sc.add(name, start.elapsed(), detail, None),
        }
        unwrap_or_resume(result)
    }

    fn trace_standalone<F, R>(&self, name: &str, detail: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        let error = result.as_ref().err().map(|p| ErrorPayload {
            class: "panic".to_string(),
            message: panic_message(p.as_ref()),
            backtrace: Vec::new(),
        });
        let mut outcome = RequestOutcome::new(Kind::Custom, name, detail, started_at, start.elapsed());
        outcome.error = error;
        self.collector.collect(outcome);
        unwrap_or_resume(result)
    }

    /// `Span(name){block}`: explicit nested span via the current span
    /// stack. Identical to `trace`'s nested path; kept as a distinct entry
    /// point to match the four user-facing shapes spec.md enumerates.
    pub fn span<F, R>(&self, segment_collector: Option<&mut SegmentCollector>, name: &str, detail: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.trace(segment_collector, name, detail, f)
    }

    /// `StartTrace` half of the manual open/close pair.
    pub fn start_trace(&self, sc: &mut SegmentCollector, name: &str, detail: &str) -> ManualSpan {
        let span_id = sc.push_span(name, detail);
        ManualSpan {
            span_id,
            fallback_start: Instant::now(),
            fallback_name: name.to_string(),
            fallback_detail: detail.to_string(),
            finished: false,
        }
    }

    /// `TrackRequest(kind, target, operation){block}`: wraps an arbitrary
    /// non-HTTP operation. Pre-samples before materializing a
    /// `SegmentCollector` — the collector is only built when the endpoint
    /// is eligible for a sample — and wires a checkpoint callback that
    /// emits partial events for long-running operations.
    pub fn track_request<F, R>(&self, kind: Kind, target: &str, operation: &str, f: F) -> R
    where
        F: FnOnce(Option<&mut SegmentCollector>) -> R,
    {
        let config = self.collector.config();
        let eligible = self.collector.sampling().take_force_instrumentation(kind.as_str(), target)
            || self.should_eagerly_sample(kind, target);

        let mut sc = if eligible {
            let mut collector = SegmentCollector::new(
                config.max_segments_per_request,
                config.segment_source_threshold,
                config.segment_memory_limit,
            );
            let buffer = self.collector.buffer().clone();
            let kind_copy = kind;
            let target_owned = target.to_string();
            let operation_owned = operation.to_string();
            collector.set_checkpoint_hook(move |cp: Checkpoint| {
                let event = checkpoint_event(kind_copy, &target_owned, &operation_owned, cp);
                let _ = buffer.push(crate::event::BufferItem::Event(event));
            });
            Some(collector)
        } else {
            None
        };

        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(sc.as_mut())));
        let duration = start.elapsed();

        let error = result.as_ref().err().map(|p| ErrorPayload {
            class: "panic".to_string(),
            message: panic_message(p.as_ref()),
            backtrace: Vec::new(),
        });

        let mut outcome = RequestOutcome::new(kind, target, operation, started_at, duration);
        outcome.error = error;
        outcome.segment_collector = sc.as_mut();
        self.collector.collect(outcome);

        unwrap_or_resume(result)
    }

    fn should_eagerly_sample(&self, kind: Kind, target: &str) -> bool {
        // Read-only peek at the filling-phase/probability split
        // `SamplingRegistry` applies, evaluated before the operation runs
        // so a `SegmentCollector` can be attached from the start without
        // consuming a sample slot twice.
        let config = self.collector.config();
        self.collector.sampling().is_eligible_for_eager_instrumentation(
            kind.as_str(),
            target,
            config.max_random_samples_per_endpoint,
            config.random_sample_rate,
        )
    }
}

fn checkpoint_event(kind: Kind, target: &str, operation: &str, cp: Checkpoint) -> crate::event::Event {
    let total_ms: f64 = cp.summary.values().sum();
    let mut event = crate::event::Event::new(
        kind,
        target,
        operation,
        total_ms,
        chrono::Utc::now(),
        chrono::Duration::minutes(1),
    );
    event.metadata = cp.summary;
    event.context = Some(serde_json::json!({
        "checkpoint_number": cp.checkpoint_number,
        "segments": cp.segments.iter().map(|s| serde_json::json!({
            "kind": s.kind,
            "duration_ms": s.duration_ms,
            "detail": s.detail,
        })).collect::<Vec<_>>(),
    }));
    event
}

fn unwrap_or_resume<R>(result: std::thread::Result<R>) -> R {
    match result {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Manual open/close pair returned by `SpanApi::start_trace`.
pub struct ManualSpan {
    span_id: Option<SpanId>,
    fallback_start: Instant,
    fallback_name: String,
    fallback_detail: String,
    finished: bool,
}

impl ManualSpan {
    /// Idempotent: a second `finish` call is a no-op.
    pub fn finish(&mut self, sc: &mut SegmentCollector, error: Option<ErrorPayload>) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.span_id {
            Some(id) => sc.pop_span(id),
            None => sc.add(&self.fallback_name, self.fallback_start.elapsed(), &self.fallback_detail, None),
        }
        let _ = error; // errors on manual spans surface through the request-level Event, not the span record itself.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::collector::filters::DenylistFilter;
    use crate::config::Config;
    use crate::event::BufferItem;
    use std::sync::Arc;

    fn api() -> (SpanApi, Arc<Buffer>) {
        let config = Config::default();
        let buffer = Arc::new(Buffer::new(config.max_buffer_memory));
        let collector = Arc::new(Collector::new(config, buffer.clone(), Box::new(DenylistFilter::new(&[]))));
        (SpanApi::new(collector), buffer)
    }

    #[test]
    fn trace_without_collector_emits_standalone_custom_event() {
        let (api, buffer) = api();
        let value = api.trace(None, "background_job", "cleanup", || 42);
        assert_eq!(value, 42);
        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            BufferItem::Event(e) => assert_eq!(e.kind, Kind::Custom),
            _ => panic!("expected Event"),
        }
    }

    #[test]
    fn trace_nested_records_span_and_returns_block_value() {
        let (api, _buffer) = api();
        let mut sc = SegmentCollector::new(10, Duration::from_millis(0), None);
        let value = api.trace(Some(&mut sc), "sql", "SELECT 1", || "ok");
        assert_eq!(value, "ok");
        assert_eq!(sc.segments().len(), 1);
    }

    #[test]
    fn start_trace_finish_is_idempotent() {
        let (api, _buffer) = api();
        let mut sc = SegmentCollector::new(10, Duration::from_millis(0), None);
        let mut span = api.start_trace(&mut sc, "cache", "get user");
        span.finish(&mut sc, None);
        span.finish(&mut sc, None);
        assert_eq!(sc.segments().len(), 1);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn trace_resumes_panics_after_recording_duration() {
        let (api, _buffer) = api();
        api.trace(None, "risky", "", || -> i32 { panic!("boom") });
    }
}
