//! Adapter-aware upsert protocol (spec §4.5).
//!
//! This trait is the narrow, backend-agnostic contract the Flusher
//! consumes. Two reference implementations exist as sibling crates:
//! `apmcore-postgres` (set-based upsert + per-row advisory lock) and
//! `apmcore-sqlite` (single-writer transaction). Both differ only in how
//! they serialize merges — the Aggregator and Flusher never know which
//! one they're talking to.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::DownsampleTier;
use crate::digest::TDigest;
use crate::error::Result;
use crate::event::{Kind, SampleType};

/// Unique key identifying one persisted bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub kind: Kind,
    pub target: String,
    pub operation: String,
    pub bucket_start: DateTime<Utc>,
}

/// One aggregated group ready to be upserted as a `Bucket` row.
#[derive(Debug, Clone)]
pub struct BucketGroup {
    pub key: BucketKey,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub duration_sum: f64,
    pub duration_max: f64,
    pub duration_min: f64,
    pub metadata_sum: HashMap<String, f64>,
    pub digest: TDigest,
}

/// A `Sample` row to be inserted and linked to its bucket by key.
#[derive(Debug, Clone)]
pub struct SampleRow {
    pub bucket_key: BucketKey,
    pub sample_type: SampleType,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub context: Option<Value>,
    pub error_fingerprint: Option<String>,
}

/// One error group's updates collected during a single flush cycle.
#[derive(Debug, Clone)]
pub struct ErrorGroup {
    pub fingerprint: String,
    pub kind: Kind,
    pub error_class: String,
    pub message: String,
    /// Occurrence timestamps observed this cycle (folded into the
    /// multi-resolution histogram by the adapter).
    pub occurrences: Vec<DateTime<Utc>>,
    /// Bounded context ring contributions from this cycle, oldest first.
    pub contexts: Vec<Value>,
}

/// Counter bucket row for the EventsPath pipeline.
#[derive(Debug, Clone)]
pub struct EventBucketRow {
    pub name: String,
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
}

/// Counter sample row for the EventsPath pipeline.
#[derive(Debug, Clone)]
pub struct EventSampleRow {
    pub name: String,
    pub payload: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of one downsampling tier pass, used for logging/testing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownsampleStats {
    pub groups_considered: u64,
    pub buckets_merged: u64,
    pub buckets_deleted: u64,
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionStats {
    pub buckets_deleted: u64,
    pub samples_deleted: u64,
    pub errors_deleted: u64,
}

/// The ten-operation contract spec §4.5 enumerates. `merge_*` helpers with
/// the same semantics live in [`crate::merge`] as pure functions so both
/// reference adapters share one tested implementation instead of each
/// re-deriving it.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Upserts additive fields by key; merges `metadata_sum` and
    /// `p95_digest`. Returns the persisted row id for each key so samples
    /// can be linked to it.
    async fn persist_buckets(&self, groups: &[BucketGroup]) -> Result<HashMap<BucketKey, i64>>;

    /// Bulk-inserts samples, skipping (not failing the batch for) any
    /// sample whose bucket id is missing from `bucket_ids`.
    async fn persist_samples(
        &self,
        samples: &[SampleRow],
        bucket_ids: &HashMap<BucketKey, i64>,
    ) -> Result<()>;

    /// Upserts by fingerprint; merges bounded contexts and the occurrence
    /// histogram.
    async fn persist_errors(&self, errors: &[ErrorGroup]) -> Result<()>;

    /// Upserts by `(name, bucket_start)`.
    async fn persist_event_buckets(&self, rows: &[EventBucketRow]) -> Result<()>;

    /// Inserts counter samples and rotates them per-name.
    async fn persist_event_samples(&self, rows: &[EventSampleRow]) -> Result<()>;

    /// Runs one downsampling tier: groups buckets older than
    /// `tier.age_threshold` by `(kind, target, operation,
    /// floor(bucket_start, tier.target_interval))`, merges groups with
    /// ≥2 members into one survivor, deletes the rest.
    async fn downsample(&self, tier: DownsampleTier, now: DateTime<Utc>) -> Result<DownsampleStats>;

    /// Deletes rows older than `retention` in batches of `batch_size`.
    async fn apply_retention(
        &self,
        retention: std::time::Duration,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<RetentionStats>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    //! In-memory `PersistenceAdapter` for exercising the Flusher/Aggregator
    //! without a database. Not a reference backend implementation — see
    //! `apmcore-postgres` / `apmcore-sqlite` for those.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct StoredBucket {
        pub count: u64,
        pub success_count: u64,
        pub failure_count: u64,
        pub duration_sum: f64,
        pub duration_max: f64,
        pub duration_min: f64,
        pub metadata_sum: HashMap<String, f64>,
        pub digest: TDigest,
    }

    #[derive(Debug, Clone, Default)]
    pub struct StoredError {
        pub kind: Kind2,
        pub occurrences_count: u64,
        pub first_occurred_at: Option<DateTime<Utc>>,
        pub last_occurred_at: Option<DateTime<Utc>>,
        pub contexts: Vec<Value>,
    }

    // A tiny newtype so `StoredError` can derive `Default` even though
    // `Kind` itself has no meaningful default.
    #[derive(Debug, Clone, Copy)]
    pub struct Kind2(pub Kind);
    impl Default for Kind2 {
        fn default() -> Self {
            Kind2(Kind::Custom)
        }
    }

    #[derive(Default)]
    struct State {
        buckets: HashMap<BucketKey, StoredBucket>,
        bucket_ids: HashMap<BucketKey, i64>,
        next_bucket_id: i64,
        samples: Vec<SampleRow>,
        errors: HashMap<String, StoredError>,
        event_buckets: HashMap<(String, DateTime<Utc>), u64>,
        event_samples: Vec<EventSampleRow>,
        persist_calls: u64,
    }

    /// In-memory adapter used by apmcore's own integration tests.
    pub struct InMemoryAdapter {
        state: Mutex<State>,
        /// When set, `persist_buckets` returns this error instead of
        /// succeeding — used to exercise CircuitBreaker/re-queue behavior.
        pub fail_next: std::sync::atomic::AtomicBool,
    }

    impl Default for InMemoryAdapter {
        fn default() -> Self {
            Self {
                state: Mutex::new(State::default()),
                fail_next: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl InMemoryAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn bucket(&self, key: &BucketKey) -> Option<StoredBucket> {
            self.state.lock().buckets.get(key).cloned()
        }

        pub fn error(&self, fingerprint: &str) -> Option<StoredError> {
            self.state.lock().errors.get(fingerprint).cloned()
        }

        pub fn sample_count(&self) -> usize {
            self.state.lock().samples.len()
        }

        pub fn total_bucket_count(&self) -> u64 {
            self.state.lock().buckets.values().map(|b| b.count).sum()
        }

        pub fn persist_calls(&self) -> u64 {
            self.state.lock().persist_calls
        }
    }

    #[async_trait]
    impl PersistenceAdapter for InMemoryAdapter {
        async fn persist_buckets(&self, groups: &[BucketGroup]) -> Result<HashMap<BucketKey, i64>> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::error::Error::PersistFailure("injected failure".into()));
            }
            let mut state = self.state.lock();
            state.persist_calls += 1;
            let mut ids = HashMap::new();
            for g in groups {
                let entry = state.buckets.entry(g.key.clone()).or_default();
                entry.count += g.count;
                entry.success_count += g.success_count;
                entry.failure_count += g.failure_count;
                entry.duration_sum += g.duration_sum;
                entry.duration_max = entry.duration_max.max(g.duration_max);
                entry.duration_min = if entry.count == g.count {
                    g.duration_min
                } else {
                    entry.duration_min.min(g.duration_min)
                };
                for (k, v) in &g.metadata_sum {
                    *entry.metadata_sum.entry(k.clone()).or_insert(0.0) += v;
                }
                entry.digest.merge(&g.digest);

                let id = *state
                    .bucket_ids
                    .entry(g.key.clone())
                    .or_insert_with(|| {
                        state.next_bucket_id += 1;
                        state.next_bucket_id
                    });
                ids.insert(g.key.clone(), id);
            }
            Ok(ids)
        }

        async fn persist_samples(
            &self,
            samples: &[SampleRow],
            bucket_ids: &HashMap<BucketKey, i64>,
        ) -> Result<()> {
            let mut state = self.state.lock();
            for s in samples {
                if bucket_ids.contains_key(&s.bucket_key) {
                    state.samples.push(s.clone());
                }
            }
            Ok(())
        }

        async fn persist_errors(&self, errors: &[ErrorGroup]) -> Result<()> {
            let mut state = self.state.lock();
            for e in errors {
                let entry = state.errors.entry(e.fingerprint.clone()).or_insert_with(|| StoredError {
                    kind: Kind2(e.kind),
                    occurrences_count: 0,
                    first_occurred_at: None,
                    last_occurred_at: None,
                    contexts: Vec::new(),
                });
                entry.occurrences_count += e.occurrences.len() as u64;
                for t in &e.occurrences {
                    entry.first_occurred_at = Some(entry.first_occurred_at.map_or(*t, |f| f.min(*t)));
                    entry.last_occurred_at = Some(entry.last_occurred_at.map_or(*t, |l| l.max(*t)));
                }
                entry.contexts.extend(e.contexts.iter().cloned());
            }
            Ok(())
        }

        async fn persist_event_buckets(&self, rows: &[EventBucketRow]) -> Result<()> {
            let mut state = self.state.lock();
            for r in rows {
                *state
                    .event_buckets
                    .entry((r.name.clone(), r.bucket_start))
                    .or_insert(0) += r.count;
            }
            Ok(())
        }

        async fn persist_event_samples(&self, rows: &[EventSampleRow]) -> Result<()> {
            self.state.lock().event_samples.extend(rows.iter().cloned());
            Ok(())
        }

        async fn downsample(&self, tier: DownsampleTier, now: DateTime<Utc>) -> Result<DownsampleStats> {
            let mut state = self.state.lock();
            let threshold = now - chrono::Duration::from_std(tier.age_threshold).unwrap();
            let target_secs = tier.target_interval.as_secs() as i64;

            let mut groups: HashMap<(Kind, String, String, DateTime<Utc>), Vec<BucketKey>> = HashMap::new();
            for key in state.buckets.keys() {
                if key.bucket_start > threshold {
                    continue;
                }
                let aligned = crate::event::truncate_to(key.bucket_start, chrono::Duration::seconds(target_secs.max(1)));
                groups
                    .entry((key.kind, key.target.clone(), key.operation.clone(), aligned))
                    .or_default()
                    .push(key.clone());
            }

            let mut stats = DownsampleStats::default();
            for ((kind, target, operation, aligned), keys) in groups {
                stats.groups_considered += 1;
                if keys.len() < 2 {
                    continue;
                }
                let survivor_key = BucketKey {
                    kind,
                    target,
                    operation,
                    bucket_start: aligned,
                };
                let mut merged = StoredBucket::default();
                for k in &keys {
                    if let Some(b) = state.buckets.remove(k) {
                        merged.count += b.count;
                        merged.success_count += b.success_count;
                        merged.failure_count += b.failure_count;
                        merged.duration_sum += b.duration_sum;
                        merged.duration_max = merged.duration_max.max(b.duration_max);
                        merged.duration_min = if merged.count == b.count {
                            b.duration_min
                        } else {
                            merged.duration_min.min(b.duration_min)
                        };
                        for (mk, mv) in b.metadata_sum {
                            *merged.metadata_sum.entry(mk).or_insert(0.0) += mv;
                        }
                        merged.digest.merge(&b.digest);
                        stats.buckets_deleted += 1;
                    }
                }
                stats.buckets_merged += 1;
                state.buckets.insert(survivor_key, merged);
            }
            Ok(stats)
        }

        async fn apply_retention(
            &self,
            retention: std::time::Duration,
            _batch_size: usize,
            now: DateTime<Utc>,
        ) -> Result<RetentionStats> {
            let mut state = self.state.lock();
            let threshold = now - chrono::Duration::from_std(retention).unwrap();
            let before = state.buckets.len();
            state.buckets.retain(|k, _| k.bucket_start >= threshold);
            let deleted = (before - state.buckets.len()) as u64;
            Ok(RetentionStats {
                buckets_deleted: deleted,
                samples_deleted: 0,
                errors_deleted: 0,
            })
        }
    }
}
