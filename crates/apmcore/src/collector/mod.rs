//! Language-neutral entry point tying normalization, filtering, sampling,
//! and context assembly into one `Event` emission (spec §4.3).

pub mod filters;
pub mod sampling;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::buffer::{Buffer, PushOutcome};
use crate::config::Config;
use crate::event::{BufferItem, ErrorPayload, Event, Kind};
use crate::segment::{inject_root, SegmentCollector, SegmentRecord};
use filters::{IgnoreSet, ParamFilter};
use sampling::SamplingRegistry;

/// What happened to one `Collector::collect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Target matched an ignore pattern; nothing was recorded.
    Ignored,
    /// Recorded into the buffer as a counter-only event (no context built).
    NotSampled,
    /// Recorded into the buffer with a full sampled context.
    Sampled,
}

/// Everything the host passes in to describe one completed operation.
pub struct RequestOutcome<'a> {
    pub kind: Kind,
    pub target: &'a str,
    pub operation: &'a str,
    pub started_at: DateTime<Utc>,
    /// Used verbatim unless `segment_collector` is present, in which case
    /// duration is recomputed from `segment_collector.request_start()` so
    /// middleware time upstream of the first span is included.
    pub fallback_duration: Duration,
    pub status: Option<i32>,
    pub error: Option<ErrorPayload>,
    /// Raw, unscrubbed request parameters. Only consulted if the event ends
    /// up sampled.
    pub params: Option<Value>,
    pub segment_collector: Option<&'a mut SegmentCollector>,
    /// Elapsed time between request start and the first controller span
    /// starting, when known. Large gaps get a synthetic middleware segment.
    pub pre_controller_gap: Option<Duration>,
    /// Pre-computed sampling decision. `TrackRequest` must decide whether
    /// to materialize a `SegmentCollector` before the operation runs, so it
    /// calls `SamplingRegistry::decide` itself up front; setting this skips
    /// `collect`'s own call so the endpoint's counters aren't consumed
    /// twice for one operation. `None` means "decide normally".
    pub precomputed_sample_type: Option<Option<crate::event::SampleType>>,
}

impl<'a> RequestOutcome<'a> {
    /// Convenience constructor for the common case (no pre-computed
    /// sampling decision, no pre-controller gap).
    pub fn new(kind: Kind, target: &'a str, operation: &'a str, started_at: DateTime<Utc>, fallback_duration: Duration) -> Self {
        Self {
            kind,
            target,
            operation,
            started_at,
            fallback_duration,
            status: None,
            error: None,
            params: None,
            segment_collector: None,
            pre_controller_gap: None,
            precomputed_sample_type: None,
        }
    }
}

pub struct Collector {
    config: Config,
    buffer: std::sync::Arc<Buffer>,
    ignore_set: IgnoreSet,
    param_filter: Box<dyn ParamFilter>,
    sampling: SamplingRegistry,
}

impl Collector {
    pub fn new(config: Config, buffer: std::sync::Arc<Buffer>, param_filter: Box<dyn ParamFilter>) -> Self {
        let ignore_set = IgnoreSet::compile(&config.ignored_targets);
        Self {
            config,
            buffer,
            ignore_set,
            param_filter,
            sampling: SamplingRegistry::new(),
        }
    }

    pub fn sampling(&self) -> &SamplingRegistry {
        &self.sampling
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffer(&self) -> &std::sync::Arc<Buffer> {
        &self.buffer
    }

    /// Runs the full eight-step pipeline and emits (at most) one `Event`.
    pub fn collect(&self, outcome: RequestOutcome<'_>) -> CollectOutcome {
        let target = normalize(outcome.target);
        let operation = normalize(outcome.operation);

        if self.ignore_set.matches(&target) {
            return CollectOutcome::Ignored;
        }

        let was_instrumented = outcome.segment_collector.is_some();
        let duration = match &outcome.segment_collector {
            Some(sc) => sc.request_start().elapsed(),
            None => outcome.fallback_duration,
        };

        let slow_threshold = self.config.slow_threshold_for(outcome.kind.as_str());
        let has_error = outcome.error.is_some();
        let sample_type = match outcome.precomputed_sample_type {
            Some(decided) => decided,
            None => self.sampling.decide(
                outcome.kind.as_str(),
                &target,
                has_error,
                duration,
                slow_threshold,
                self.config.max_random_samples_per_endpoint,
                self.config.random_sample_rate,
            ),
        };

        let is_slow_or_error = has_error || duration >= slow_threshold;
        self.sampling
            .record_outcome(outcome.kind.as_str(), &target, was_instrumented, is_slow_or_error);

        let mut event = Event::new(
            outcome.kind,
            target,
            operation,
            duration.as_secs_f64() * 1000.0,
            outcome.started_at,
            chrono::Duration::from_std(self.config.base_granularity).unwrap(),
        );
        event.status = outcome.status;
        event.error = outcome.error;
        event.sample_type = sample_type;

        let emitted_sampled = sample_type.is_some();
        if emitted_sampled {
            event.context = Some(self.build_context(&outcome.params, outcome.segment_collector, outcome.pre_controller_gap, event.duration_ms, event.error.is_some()));
        }

        let _: PushOutcome = self.buffer.push(BufferItem::Event(event));

        if emitted_sampled {
            CollectOutcome::Sampled
        } else {
            CollectOutcome::NotSampled
        }
    }

    fn build_context(
        &self,
        params: &Option<Value>,
        segment_collector: Option<&mut SegmentCollector>,
        pre_controller_gap: Option<Duration>,
        request_duration_ms: f64,
        has_error: bool,
    ) -> Value {
        let scrubbed_params = params
            .as_ref()
            .map(|p| self.param_filter.scrub(p))
            .unwrap_or(Value::Null);

        let segments = segment_collector
            .map(|sc| {
                let (segments, _summary) = sc.to_summary();
                let segments = collapse_code_wrappers(segments);
                let segments = match pre_controller_gap {
                    Some(gap) if gap >= self.config.segment_source_threshold => {
                        prepend_middleware_segment(segments, gap)
                    }
                    _ => segments,
                };
                let segments = if has_error {
                    append_error_marker(segments)
                } else {
                    segments
                };
                inject_root(segments, request_duration_ms)
            })
            .unwrap_or_default();

        json!({
            "params": scrubbed_params,
            "segments": segments.iter().map(segment_to_json).collect::<Vec<_>>(),
        })
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_string()
}

fn segment_to_json(s: &SegmentRecord) -> Value {
    json!({
        "kind": s.kind,
        "duration_ms": s.duration_ms,
        "detail": s.detail,
        "offset_ms": s.offset_ms,
        "source": s.source,
        "parent_index": s.parent_index,
    })
}

/// Near-zero-duration "code" wrapper spans that accidentally envelop a
/// `controller` span are removed, with their children reparented onto the
/// wrapper's own parent (spec §4.3 step 7). A wrapper is recognized by
/// kind `"code"` and a duration under 1ms.
fn collapse_code_wrappers(segments: Vec<SegmentRecord>) -> Vec<SegmentRecord> {
    let wrapper_indices: Vec<usize> = segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == "code" && s.duration_ms < 1.0)
        .map(|(i, _)| i)
        .collect();
    if wrapper_indices.is_empty() {
        return segments;
    }

    let mut redirect = std::collections::HashMap::new();
    for &wi in &wrapper_indices {
        let grandparent = segments[wi].parent_index;
        redirect.insert(wi, grandparent);
    }

    let kept: Vec<(usize, SegmentRecord)> = segments
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !wrapper_indices.contains(i))
        .collect();

    let mut old_to_new = std::collections::HashMap::new();
    for (new_idx, (old_idx, _)) in kept.iter().enumerate() {
        old_to_new.insert(*old_idx, new_idx);
    }

    kept.into_iter()
        .map(|(_, mut s)| {
            let mut parent = s.parent_index;
            while let Some(p) = parent {
                if let Some(&redirected) = redirect.get(&p) {
                    parent = redirected;
                } else {
                    break;
                }
            }
            s.parent_index = parent.and_then(|p| old_to_new.get(&p).copied());
            s
        })
        .collect()
}

fn prepend_middleware_segment(mut segments: Vec<SegmentRecord>, gap: Duration) -> Vec<SegmentRecord> {
    for s in segments.iter_mut() {
        s.parent_index = match s.parent_index {
            Some(i) => Some(i + 1),
            None => Some(0),
        };
    }
    let middleware = SegmentRecord {
        kind: "middleware".to_string(),
        duration_ms: gap.as_secs_f64() * 1000.0,
        detail: String::new(),
        offset_ms: Some(0.0),
        source: None,
        parent_index: None,
        span_id: None,
        parent_span_id: None,
    };
    let mut out = Vec::with_capacity(segments.len() + 1);
    out.push(middleware);
    out.append(&mut segments);
    out
}

fn append_error_marker(mut segments: Vec<SegmentRecord>) -> Vec<SegmentRecord> {
    segments.push(SegmentRecord {
        kind: "error".to_string(),
        duration_ms: 0.0,
        detail: String::new(),
        offset_ms: None,
        source: None,
        parent_index: None,
        span_id: None,
        parent_span_id: None,
    });
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::filters::DenylistFilter;
    use std::sync::Arc;

    fn collector_with(config: Config) -> (Collector, Arc<Buffer>) {
        let buffer = Arc::new(Buffer::new(config.max_buffer_memory));
        let collector = Collector::new(config, buffer.clone(), Box::new(DenylistFilter::new(&[])));
        (collector, buffer)
    }

    #[test]
    fn ignored_target_never_reaches_buffer() {
        let mut config = Config::default();
        config.ignored_targets = vec!["HealthController#show".to_string()];
        let (collector, buffer) = collector_with(config);

        let outcome = collector.collect(RequestOutcome {
            kind: Kind::Http,
            target: "HealthController#show",
            operation: "GET",
            started_at: Utc::now(),
            fallback_duration: Duration::from_millis(5),
            status: Some(200),
            error: None,
            params: None,
            segment_collector: None,
            pre_controller_gap: None,
            precomputed_sample_type: None,
        });

        assert_eq!(outcome, CollectOutcome::Ignored);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn unsampled_event_has_no_context() {
        let mut config = Config::default();
        config.max_random_samples_per_endpoint = 0;
        config.random_sample_rate = 1_000_000_000;
        let (collector, buffer) = collector_with(config);

        let outcome = collector.collect(RequestOutcome {
            kind: Kind::Http,
            target: "UsersController#index",
            operation: "GET",
            started_at: Utc::now(),
            fallback_duration: Duration::from_millis(5),
            status: Some(200),
            error: None,
            params: None,
            segment_collector: None,
            pre_controller_gap: None,
            precomputed_sample_type: None,
        });

        assert_eq!(outcome, CollectOutcome::NotSampled);
        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            BufferItem::Event(e) => assert!(e.context.is_none()),
            _ => panic!("expected Event"),
        }
    }

    #[test]
    fn error_event_is_always_sampled_with_context() {
        let (collector, buffer) = collector_with(Config::default());
        let outcome = collector.collect(RequestOutcome {
            kind: Kind::Http,
            target: "UsersController#create",
            operation: "POST",
            started_at: Utc::now(),
            fallback_duration: Duration::from_millis(5),
            status: Some(500),
            error: Some(ErrorPayload {
                class: "RuntimeError".into(),
                message: "boom".into(),
                backtrace: vec![],
            }),
            params: Some(json!({"password": "hunter2"})),
            segment_collector: None,
            pre_controller_gap: None,
            precomputed_sample_type: None,
        });

        assert_eq!(outcome, CollectOutcome::Sampled);
        let drained = buffer.drain();
        match &drained[0] {
            BufferItem::Event(e) => {
                let ctx = e.context.as_ref().unwrap();
                assert_eq!(ctx["params"]["password"], json!("[FILTERED]"));
            }
            _ => panic!("expected Event"),
        }
    }

    #[test]
    fn code_wrapper_is_collapsed_and_children_reparented() {
        let segments = vec![
            SegmentRecord {
                kind: "code".into(),
                duration_ms: 0.1,
                detail: String::new(),
                offset_ms: None,
                source: None,
                parent_index: None,
                span_id: None,
                parent_span_id: None,
            },
            SegmentRecord {
                kind: "controller".into(),
                duration_ms: 12.0,
                detail: "UsersController#index".into(),
                offset_ms: None,
                source: None,
                parent_index: Some(0),
                span_id: None,
                parent_span_id: None,
            },
        ];
        let collapsed = collapse_code_wrappers(segments);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].kind, "controller");
        assert_eq!(collapsed[0].parent_index, None);
    }
}
