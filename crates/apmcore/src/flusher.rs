//! Scheduled background flush cycle (spec §4.7).
//!
//! Uses an `AtomicBool` shutdown flag checked between short sleeps rather
//! than a single long sleep, so shutdown stays responsive. Runs as a
//! `tokio` task since the persistence adapters are async.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::aggregator::Aggregator;
use crate::buffer::Buffer;
use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::error::Error;
use crate::event::BufferItem;
use crate::persistence::{BucketKey, PersistenceAdapter};

/// Identifies one aggregated group for the purpose of the single re-queue
/// attempt (spec §4.6), independent of the particular `Event`/`CustomEvent`
/// values `reconstitute` happens to rebuild for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RequeueKey {
    Bucket(BucketKey),
    Custom(String, DateTime<Utc>),
}

/// Running counters exposed for observability/testing, in the same
/// `snapshot_count`-style bookkeeping as the rest of the daemon loop.
#[derive(Debug, Default)]
pub struct FlusherStats {
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub requeued_events: AtomicU64,
    pub dropped_on_requeue: AtomicU64,
}

pub type ErrorHandler = Box<dyn Fn(&Error) + Send + Sync>;

pub struct Flusher {
    config: Config,
    buffer: Arc<Buffer>,
    circuit: Arc<CircuitBreaker>,
    adapter: Box<dyn PersistenceAdapter>,
    last_maintenance: Mutex<Instant>,
    stats: FlusherStats,
    error_handler: Option<ErrorHandler>,
    shutdown: AtomicBool,
    /// Groups already given their one re-queue attempt. Cleared on the next
    /// successful flush, since everything pending is then resolved.
    requeued_once: Mutex<HashSet<RequeueKey>>,
}

impl Flusher {
    pub fn new(config: Config, buffer: Arc<Buffer>, circuit: Arc<CircuitBreaker>, adapter: Box<dyn PersistenceAdapter>) -> Self {
        Self {
            config,
            buffer,
            circuit,
            adapter,
            last_maintenance: Mutex::new(Instant::now()),
            stats: FlusherStats::default(),
            error_handler: None,
            shutdown: AtomicBool::new(false),
            requeued_once: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn stats(&self) -> &FlusherStats {
        &self.stats
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Runs the scheduling loop until `request_shutdown` is called. Intended
    /// to be driven by `tokio::spawn(Arc::clone(&flusher).run_forever())`.
    pub async fn run_forever(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("flusher: shutdown requested, exiting scheduling loop");
                return;
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, "flush cycle failed");
            }

            let jitter_ms = self.config.flush_jitter.as_millis() as i64;
            let jitter = if jitter_ms > 0 {
                let signed = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
                Duration::from_millis(signed.unsigned_abs())
            } else {
                Duration::ZERO
            };
            let sleep_for = self.config.flush_interval.saturating_add(jitter);
            self.sleep_responsively(sleep_for).await;
        }
    }

    async fn sleep_responsively(&self, total: Duration) {
        let step = Duration::from_millis(100);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let this_step = remaining.min(step);
            tokio::time::sleep(this_step).await;
            remaining = remaining.saturating_sub(this_step);
        }
    }

    /// One flush cycle (spec §4.7 steps 1-8).
    pub async fn run_once(&self) -> Result<(), Error> {
        if self.circuit.is_open() {
            debug!("flusher: circuit open, skipping cycle");
            return Ok(());
        }

        let items = self.buffer.drain();
        if items.is_empty() {
            return Ok(());
        }
        debug!(drained = items.len(), "flusher: draining buffer");

        let (performance, counters): (Vec<BufferItem>, Vec<BufferItem>) =
            items.into_iter().partition(|i| matches!(i, BufferItem::Event(_)));
        let mut combined = performance;
        combined.extend(counters);

        let aggregator = Aggregator::new(&self.config);
        let result = aggregator.run(combined);

        match self.persist(&result).await {
            Ok(()) => {
                self.circuit.record_success();
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.requeued_once.lock().clear();
            }
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.circuit.record_failure();
                if let Some(handler) = &self.error_handler {
                    handler(&e);
                }
                if self.config.requeue_on_persist_failure {
                    self.requeue_after_failure(result);
                }
                return Err(e);
            }
        }

        if self.last_maintenance.lock().elapsed() >= self.config.cleanup_interval {
            self.run_maintenance().await;
            *self.last_maintenance.lock() = Instant::now();
        }

        Ok(())
    }

    async fn persist(&self, result: &crate::aggregator::AggregationResult) -> Result<(), Error> {
        let bucket_ids = self.adapter.persist_buckets(&result.buckets).await?;
        self.adapter.persist_samples(&result.samples, &bucket_ids).await?;
        self.adapter.persist_errors(&result.errors).await?;
        self.adapter.persist_event_buckets(&result.event_buckets).await?;
        self.adapter.persist_event_samples(&result.event_samples).await?;
        Ok(())
    }

    /// Pushes drained-but-unpersisted groups back into the buffer, but only
    /// once per group: a group still failing on its second consecutive
    /// cycle is dropped and counted instead of requeued again (spec §4.6).
    /// Respects the buffer's hard cap independently of that bookkeeping —
    /// overflow there is also dropped and counted, never retried.
    fn requeue_after_failure(&self, result: crate::aggregator::AggregationResult) {
        let reconstituted = reconstitute(result);
        let mut seen = self.requeued_once.lock();
        let mut items = Vec::with_capacity(reconstituted.len());
        let mut already_requeued = 0u64;
        for (key, item) in reconstituted {
            if seen.contains(&key) {
                already_requeued += 1;
            } else {
                seen.insert(key);
                items.push(item);
            }
        }
        drop(seen);

        let total = items.len() as u64;
        let accepted = self.buffer.requeue(items) as u64;
        self.stats.requeued_events.fetch_add(accepted, Ordering::Relaxed);
        let dropped = (total - accepted) + already_requeued;
        if dropped > 0 {
            self.stats.dropped_on_requeue.fetch_add(dropped, Ordering::Relaxed);
            warn!(
                dropped,
                already_requeued, "flusher: dropping items past their single re-queue attempt or the buffer's hard cap"
            );
        }
    }

    async fn run_maintenance(&self) {
        let now = chrono::Utc::now();
        for tier in self.config.downsampling_tiers.clone() {
            match self.adapter.downsample(tier, now).await {
                Ok(stats) => debug!(
                    merged = stats.buckets_merged,
                    deleted = stats.buckets_deleted,
                    "downsample tier complete"
                ),
                Err(e) => warn!(error = %e, "downsample tier failed"),
            }
        }

        match self
            .adapter
            .apply_retention(self.config.retention_period, self.config.cleanup_batch_size, now)
            .await
        {
            Ok(stats) => debug!(
                buckets = stats.buckets_deleted,
                samples = stats.samples_deleted,
                errors = stats.errors_deleted,
                "retention pass complete"
            ),
            Err(e) => warn!(error = %e, "retention pass failed"),
        }
    }
}

/// Rebuilds `BufferItem`s from an already-aggregated cycle for the single
/// retry requeue, each tagged with the key its group is tracked under.
/// Aggregation is lossy (events of the same bucket key are folded), so
/// what gets requeued is the aggregated group, not the original individual
/// events — acceptable because the next successful flush cycle just
/// upserts the same key again.
fn reconstitute(result: crate::aggregator::AggregationResult) -> Vec<(RequeueKey, BufferItem)> {
    use crate::event::{CustomEvent, Event};

    let mut items = Vec::with_capacity(result.buckets.len() + result.event_buckets.len());
    for group in result.buckets {
        let key = RequeueKey::Bucket(group.key.clone());
        let mut event = Event::new(
            group.key.kind,
            group.key.target.clone(),
            group.key.operation.clone(),
            if group.count > 0 { group.duration_sum / group.count as f64 } else { 0.0 },
            group.key.bucket_start,
            chrono::Duration::seconds(60),
        );
        event.metadata = group.metadata_sum;
        event.status = if group.failure_count > 0 { Some(500) } else { Some(200) };
        items.push((key, BufferItem::Event(event)));
    }
    for row in result.event_buckets {
        let key = RequeueKey::Custom(row.name.clone(), row.bucket_start);
        for _ in 0..row.count {
            items.push((
                key.clone(),
                BufferItem::Custom(CustomEvent {
                    name: row.name.clone(),
                    payload: None,
                    recorded_at: row.bucket_start,
                }),
            ));
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorPayload, Event, Kind};
    use crate::persistence::testing::InMemoryAdapter;
    use chrono::Utc;
    use std::sync::atomic::Ordering as O;

    fn flusher_with(adapter: InMemoryAdapter) -> (Arc<Flusher>, Arc<Buffer>) {
        let config = Config::default();
        let buffer = Arc::new(Buffer::new(config.max_buffer_memory));
        let circuit = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_recovery_timeout,
        ));
        let flusher = Arc::new(Flusher::new(config, buffer.clone(), circuit, Box::new(adapter)));
        (flusher, buffer)
    }

    #[tokio::test]
    async fn empty_buffer_flush_is_a_noop() {
        let (flusher, _buffer) = flusher_with(InMemoryAdapter::new());
        flusher.run_once().await.unwrap();
        assert_eq!(flusher.stats().flushes.load(O::Relaxed), 0);
    }

    #[tokio::test]
    async fn successful_flush_persists_and_records_success() {
        let (flusher, buffer) = flusher_with(InMemoryAdapter::new());
        buffer.push(BufferItem::Event(Event::new(
            Kind::Http,
            "UsersController#index",
            "GET",
            10.0,
            Utc::now(),
            chrono::Duration::minutes(1),
        )));

        flusher.run_once().await.unwrap();
        assert_eq!(flusher.stats().flushes.load(O::Relaxed), 1);
        assert_eq!(flusher.circuit.state(), crate::circuit::State::Closed);
    }

    #[tokio::test]
    async fn failed_flush_requeues_and_opens_circuit_after_threshold() {
        let adapter = InMemoryAdapter::new();
        adapter.fail_next.store(true, O::SeqCst);
        let (flusher, buffer) = flusher_with(adapter);
        for _ in 0..flusher.config.circuit_breaker_failure_threshold {
            flusher.circuit.record_failure();
        }
        flusher.circuit.record_success(); // reset for a clean test

        buffer.push(BufferItem::Event(Event::new(
            Kind::Http,
            "UsersController#index",
            "GET",
            10.0,
            Utc::now(),
            chrono::Duration::minutes(1),
        )));

        let result = flusher.run_once().await;
        assert!(result.is_err());
        assert_eq!(flusher.stats().flush_failures.load(O::Relaxed), 1);
        // The single event was aggregated into one group and requeued.
        assert!(buffer.size() >= 1);
    }

    #[tokio::test]
    async fn open_circuit_skips_persistence_but_drains() {
        let (flusher, buffer) = flusher_with(InMemoryAdapter::new());
        for _ in 0..flusher.config.circuit_breaker_failure_threshold {
            flusher.circuit.record_failure();
        }
        assert!(flusher.circuit.is_open());

        buffer.push(BufferItem::Event(Event::new(
            Kind::Job,
            "ReportJob",
            "",
            5.0,
            Utc::now(),
            chrono::Duration::minutes(1),
        )));
        flusher.run_once().await.unwrap();
        assert_eq!(flusher.stats().flushes.load(O::Relaxed), 0);
        // Buffer untouched: the circuit check returns before draining.
        assert_eq!(buffer.size(), 1);
    }

    #[tokio::test]
    async fn error_events_fold_into_error_group() {
        let (flusher, buffer) = flusher_with(InMemoryAdapter::new());
        let mut event = Event::new(Kind::Http, "T", "GET", 5.0, Utc::now(), chrono::Duration::minutes(1));
        event.error = Some(ErrorPayload {
            class: "RuntimeError".into(),
            message: "boom".into(),
            backtrace: vec![],
        });
        buffer.push(BufferItem::Event(event));
        flusher.run_once().await.unwrap();
        assert_eq!(flusher.stats().flushes.load(O::Relaxed), 1);
    }
}
