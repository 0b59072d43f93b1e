//! Groups drained events by bucket key, folds metadata, feeds digests,
//! groups errors (spec §4.4). Adapter-agnostic: everything here is plain
//! in-memory folding, with no knowledge of which `PersistenceAdapter` will
//! eventually receive the result.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::event::{BufferItem, CustomEvent, Event, Kind};
use crate::fingerprint::{fingerprint, FrameClassifier};
use crate::persistence::{BucketGroup, BucketKey, ErrorGroup, EventBucketRow, EventSampleRow, SampleRow};

/// Everything one flush cycle needs to hand to `PersistenceAdapter`.
pub struct AggregationResult {
    pub buckets: Vec<BucketGroup>,
    pub samples: Vec<SampleRow>,
    pub errors: Vec<ErrorGroup>,
    pub event_buckets: Vec<EventBucketRow>,
    pub event_samples: Vec<EventSampleRow>,
}

struct WorkingBucket {
    count: u64,
    success_count: u64,
    failure_count: u64,
    duration_sum: f64,
    duration_max: f64,
    duration_min: f64,
    metadata_sum: HashMap<String, f64>,
    digest: crate::digest::TDigest,
}

impl WorkingBucket {
    fn new() -> Self {
        Self {
            count: 0,
            success_count: 0,
            failure_count: 0,
            duration_sum: 0.0,
            duration_max: f64::MIN,
            duration_min: f64::MAX,
            metadata_sum: HashMap::new(),
            digest: crate::digest::TDigest::new(100.0),
        }
    }

    fn fold(&mut self, e: &Event) {
        self.count += 1;
        if e.is_failure() {
            self.failure_count += 1;
        } else {
            self.success_count += 1;
        }
        self.duration_sum += e.duration_ms;
        self.duration_max = self.duration_max.max(e.duration_ms);
        self.duration_min = self.duration_min.min(e.duration_ms);
        for (k, v) in &e.metadata {
            *self.metadata_sum.entry(k.clone()).or_insert(0.0) += v;
        }
        self.digest.add(e.duration_ms);
    }
}

struct WorkingError {
    kind: Kind,
    error_class: String,
    message: String,
    occurrences: Vec<chrono::DateTime<Utc>>,
    contexts: Vec<Value>,
}

/// Runs one flush cycle's aggregation over a drained slice of buffer items.
pub struct Aggregator<'a> {
    config: &'a Config,
    classifier: FrameClassifier,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            classifier: FrameClassifier::default(),
        }
    }

    pub fn run(&self, items: Vec<BufferItem>) -> AggregationResult {
        let mut buckets: HashMap<BucketKey, WorkingBucket> = HashMap::new();
        let mut samples = Vec::new();
        let mut errors: HashMap<String, WorkingError> = HashMap::new();
        let mut event_counts: HashMap<(String, chrono::DateTime<Utc>), u64> = HashMap::new();
        let mut event_samples = Vec::new();

        for item in items {
            match item {
                BufferItem::Event(e) => self.fold_event(e, &mut buckets, &mut samples, &mut errors),
                BufferItem::Custom(c) => self.fold_custom(c, &mut event_counts, &mut event_samples),
            }
        }

        let bucket_groups = buckets
            .into_iter()
            .map(|(key, wb)| BucketGroup {
                key,
                count: wb.count,
                success_count: wb.success_count,
                failure_count: wb.failure_count,
                duration_sum: wb.duration_sum,
                duration_max: if wb.count == 0 { 0.0 } else { wb.duration_max },
                duration_min: if wb.count == 0 { 0.0 } else { wb.duration_min },
                metadata_sum: wb.metadata_sum,
                digest: wb.digest,
            })
            .collect();

        let error_groups = errors
            .into_iter()
            .map(|(fingerprint, we)| ErrorGroup {
                fingerprint,
                kind: we.kind,
                error_class: we.error_class,
                message: we.message,
                occurrences: we.occurrences,
                contexts: we.contexts,
            })
            .collect();

        let event_buckets = event_counts
            .into_iter()
            .map(|((name, bucket_start), count)| EventBucketRow {
                name,
                bucket_start,
                count,
            })
            .collect();

        AggregationResult {
            buckets: bucket_groups,
            samples,
            errors: error_groups,
            event_buckets,
            event_samples,
        }
    }

    fn fold_event(
        &self,
        e: Event,
        buckets: &mut HashMap<BucketKey, WorkingBucket>,
        samples: &mut Vec<SampleRow>,
        errors: &mut HashMap<String, WorkingError>,
    ) {
        let key = BucketKey {
            kind: e.kind,
            target: e.target.clone(),
            operation: e.operation.clone(),
            // Never re-truncate here — `bucket_start` was fixed at
            // construction time (spec §4.4's tie-break rule).
            bucket_start: e.bucket_start,
        };

        let mut fp = None;
        if let Some(err) = &e.error {
            fp = Some(fingerprint(
                e.kind.as_str(),
                &err.class,
                &err.backtrace,
                &self.classifier,
                self.config.fingerprint_app_frames,
            ));
            let entry = errors.entry(fp.clone().unwrap()).or_insert_with(|| WorkingError {
                kind: e.kind,
                error_class: err.class.clone(),
                message: err.message.clone(),
                occurrences: Vec::new(),
                contexts: Vec::new(),
            });
            entry.occurrences.push(e.started_at);
            if let Some(ctx) = &e.context {
                if entry.contexts.len() < self.config.max_error_contexts {
                    entry.contexts.push(ctx.clone());
                }
            }
        }

        if let Some(sample_type) = e.sample_type {
            samples.push(SampleRow {
                bucket_key: key.clone(),
                sample_type,
                recorded_at: e.started_at,
                duration_ms: e.duration_ms,
                context: e.context.clone(),
                error_fingerprint: fp,
            });
        }

        buckets.entry(key).or_insert_with(WorkingBucket::new).fold(&e);
    }

    fn fold_custom(
        &self,
        c: CustomEvent,
        counts: &mut HashMap<(String, chrono::DateTime<Utc>), u64>,
        samples: &mut Vec<EventSampleRow>,
    ) {
        let bucket_start = crate::event::truncate_to(c.recorded_at, chrono::Duration::from_std(self.config.base_granularity).unwrap());
        *counts.entry((c.name.clone(), bucket_start)).or_insert(0) += 1;

        // Long-tail retention: always keep up to `events_max_samples_per_name`
        // FIFO, plus an extra `1/random_sample_rate` probability tail for
        // diversity beyond the cap (spec §4.9).
        let keep = samples
            .iter()
            .filter(|s: &&EventSampleRow| s.name == c.name)
            .count()
            < self.config.events_max_samples_per_name as usize
            || rand_bool(self.config.random_sample_rate);
        if keep {
            samples.push(EventSampleRow {
                name: c.name,
                payload: c.payload,
                recorded_at: c.recorded_at,
            });
        }
    }
}

fn rand_bool(one_in_n: u32) -> bool {
    if one_in_n <= 1 {
        return true;
    }
    use rand::Rng;
    rand::thread_rng().gen_range(0..one_in_n) == 0
}

/// Checks the sample-type-present invariant the rest of the pipeline
/// relies on: only sampled events should ever reach a non-empty context.
pub fn coerce_metadata(raw: &HashMap<String, Value>) -> HashMap<String, f64> {
    raw.iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ErrorPayload;
    use chrono::TimeZone;

    fn http_event(duration_ms: f64, started_at: chrono::DateTime<Utc>) -> BufferItem {
        BufferItem::Event(Event::new(
            Kind::Http,
            "UsersController#index",
            "GET",
            duration_ms,
            started_at,
            chrono::Duration::minutes(1),
        ))
    }

    #[test]
    fn basic_aggregation_scenario() {
        let cfg = Config::default();
        let agg = Aggregator::new(&cfg);
        let started_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 15).unwrap();
        let items: Vec<BufferItem> = [10.0, 20.0, 30.0, 40.0, 50.0]
            .into_iter()
            .map(|d| http_event(d, started_at))
            .collect();

        let result = agg.run(items);
        assert_eq!(result.buckets.len(), 1);
        let b = &result.buckets[0];
        assert_eq!(b.count, 5);
        assert_eq!(b.success_count, 5);
        assert_eq!(b.failure_count, 0);
        assert_eq!(b.duration_sum, 150.0);
        assert_eq!(b.duration_min, 10.0);
        assert_eq!(b.duration_max, 50.0);
        assert_eq!(
            b.key.bucket_start,
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn error_grouping_scenario() {
        let cfg = Config::default();
        let agg = Aggregator::new(&cfg);
        let started_at = Utc::now();

        let mut e1 = Event::new(Kind::Http, "T", "GET", 5.0, started_at, chrono::Duration::minutes(1));
        e1.error = Some(ErrorPayload {
            class: "RuntimeError".into(),
            message: "boom".into(),
            backtrace: vec!["app/models/user.rs:42 in 'validate'".into()],
        });
        let mut e2 = e1.clone();
        e2.error = Some(ErrorPayload {
            class: "RuntimeError".into(),
            message: "boom".into(),
            backtrace: vec!["app/models/user.rs:99 in 'validate'".into()],
        });

        let result = agg.run(vec![BufferItem::Event(e1), BufferItem::Event(e2)]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].occurrences.len(), 2);
    }

    #[test]
    fn kind_distinguishes_fingerprint_scenario() {
        let cfg = Config::default();
        let agg = Aggregator::new(&cfg);
        let started_at = Utc::now();

        let mut http_err = Event::new(Kind::Http, "T", "GET", 5.0, started_at, chrono::Duration::minutes(1));
        http_err.error = Some(ErrorPayload {
            class: "RuntimeError".into(),
            message: "boom".into(),
            backtrace: vec!["app/models/user.rs:42 in 'validate'".into()],
        });
        let mut job_err = http_err.clone();
        job_err.kind = Kind::Job;

        let result = agg.run(vec![BufferItem::Event(http_err), BufferItem::Event(job_err)]);
        assert_eq!(result.errors.len(), 2);
    }
}
