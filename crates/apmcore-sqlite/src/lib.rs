//! Single-writer SQLite `PersistenceAdapter` (spec.md §4.5, variant 2).
//!
//! SQLite allows exactly one write transaction at a time, so there is no
//! per-row advisory lock to take: a single `BEGIN IMMEDIATE` transaction per
//! flush cycle gives the same serialization the Postgres adapter gets from
//! locking individual rows, just coarser. Scalar additive fields use
//! `ON CONFLICT ... DO UPDATE` with `max()`/`min()` as two-argument scalar
//! functions (SQLite has no `GREATEST`/`LEAST`); `metadata_sum` and
//! `p95_digest` still need the same read-modify-write as the Postgres
//! adapter since SQLite can't merge JSON blobs or TDigest bytes itself.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use apmcore::config::DownsampleTier;
use apmcore::error::{Error, Result};
use apmcore::merge::{merge_contexts, merge_digest, merge_metadata_sum, merge_occurrence_buckets, OccurrenceBuckets};
use apmcore::persistence::{
    BucketGroup, BucketKey, DownsampleStats, ErrorGroup, EventBucketRow, EventSampleRow, PersistenceAdapter,
    RetentionStats, SampleRow,
};

pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if absent) the database file at `path`, in WAL mode
    /// with a busy timeout tolerant of the Flusher's own jittered schedule
    /// contending with a second process's flush.
    pub async fn connect(path: &str, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(busy_timeout)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::PersistFailure(format!("sqlite connect: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceAdapter for SqliteAdapter {
    async fn persist_buckets(&self, groups: &[BucketGroup]) -> Result<HashMap<BucketKey, i64>> {
        if groups.is_empty() {
            return Ok(HashMap::new());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        let mut ids = HashMap::with_capacity(groups.len());
        for g in groups {
            sqlx::query(
                "INSERT INTO buckets
                    (kind, target, operation, bucket_start, count, success_count, failure_count,
                     duration_sum, duration_max, duration_min, metadata_sum, p95_digest)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', x'')
                 ON CONFLICT(kind, target, operation, bucket_start) DO UPDATE SET
                    count = buckets.count + excluded.count,
                    success_count = buckets.success_count + excluded.success_count,
                    failure_count = buckets.failure_count + excluded.failure_count,
                    duration_sum = buckets.duration_sum + excluded.duration_sum,
                    duration_max = max(buckets.duration_max, excluded.duration_max),
                    duration_min = min(buckets.duration_min, excluded.duration_min)",
            )
            .bind(g.key.kind.as_str())
            .bind(&g.key.target)
            .bind(&g.key.operation)
            .bind(g.key.bucket_start)
            .bind(g.count as i64)
            .bind(g.success_count as i64)
            .bind(g.failure_count as i64)
            .bind(g.duration_sum)
            .bind(g.duration_max)
            .bind(g.duration_min)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("upsert bucket: {e}")))?;

            let row = sqlx::query(
                "SELECT id, metadata_sum, p95_digest FROM buckets
                 WHERE kind = ? AND target = ? AND operation = ? AND bucket_start = ?",
            )
            .bind(g.key.kind.as_str())
            .bind(&g.key.target)
            .bind(&g.key.operation)
            .bind(g.key.bucket_start)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("fetch bucket for merge: {e}")))?;

            let id: i64 = row.try_get("id").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let metadata_json: String = row.try_get("metadata_sum").unwrap_or_else(|_| "{}".to_string());
            let existing_metadata: HashMap<String, f64> =
                serde_json::from_str(&metadata_json).unwrap_or_default();
            let existing_digest_bytes: Vec<u8> = row.try_get("p95_digest").unwrap_or_default();

            let merged_metadata = merge_metadata_sum(&existing_metadata, &g.metadata_sum);
            let merged_digest_bytes = merge_digest(&existing_digest_bytes, &g.digest.serialize());
            let merged_metadata_json = serde_json::to_string(&merged_metadata)
                .map_err(|e| Error::SerializationError(format!("metadata_sum: {e}")))?;

            sqlx::query("UPDATE buckets SET metadata_sum = ?, p95_digest = ? WHERE id = ?")
                .bind(merged_metadata_json)
                .bind(merged_digest_bytes)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::PersistFailure(format!("update bucket merge fields: {e}")))?;

            ids.insert(g.key.clone(), id);
        }

        tx.commit().await.map_err(|e| Error::PersistFailure(format!("commit buckets: {e}")))?;
        Ok(ids)
    }

    async fn persist_samples(&self, samples: &[SampleRow], bucket_ids: &HashMap<BucketKey, i64>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        for s in samples {
            let Some(bucket_id) = bucket_ids.get(&s.bucket_key) else {
                tracing::warn!(target = %s.bucket_key.target, "sample's bucket id missing, skipping row");
                continue;
            };
            let context_json = s
                .context
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default());

            sqlx::query(
                "INSERT INTO samples (bucket_id, kind, sample_type, recorded_at, duration, context, error_fingerprint)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(bucket_id)
            .bind(s.bucket_key.kind.as_str())
            .bind(s.sample_type.as_str())
            .bind(s.recorded_at)
            .bind(s.duration_ms)
            .bind(context_json)
            .bind(&s.error_fingerprint)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("insert sample: {e}")))?;
        }

        tx.commit().await.map_err(|e| Error::PersistFailure(format!("commit samples: {e}")))?;
        Ok(())
    }

    async fn persist_errors(&self, errors: &[ErrorGroup]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        for e in errors {
            let first_at = e.occurrences.iter().min().copied();
            let last_at = e.occurrences.iter().max().copied();
            let now = last_at.unwrap_or_else(Utc::now);

            let existing = sqlx::query("SELECT contexts, occurrence_buckets FROM errors WHERE fingerprint = ?")
                .bind(&e.fingerprint)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|err| Error::PersistFailure(format!("fetch error row: {err}")))?;

            let (existing_contexts, existing_buckets) = match existing {
                Some(row) => {
                    let contexts_json: String = row.try_get("contexts").unwrap_or_else(|_| "[]".to_string());
                    let contexts: Vec<serde_json::Value> = serde_json::from_str(&contexts_json).unwrap_or_default();
                    let buckets_json: String =
                        row.try_get("occurrence_buckets").unwrap_or_else(|_| "{}".to_string());
                    let buckets = OccurrenceBuckets::from_json(
                        &serde_json::from_str(&buckets_json).unwrap_or(serde_json::Value::Null),
                    )
                    .unwrap_or_default();
                    (contexts, buckets)
                }
                None => (Vec::new(), OccurrenceBuckets::default()),
            };

            let merged_contexts = merge_contexts(&existing_contexts, &e.contexts, 20);
            let merged_buckets = merge_occurrence_buckets(&existing_buckets, &e.occurrences, now);
            let merged_contexts_json = serde_json::to_string(&merged_contexts)
                .map_err(|err| Error::SerializationError(format!("contexts: {err}")))?;
            let merged_buckets_json = serde_json::to_string(&merged_buckets.to_json())
                .map_err(|err| Error::SerializationError(format!("occurrence_buckets: {err}")))?;

            sqlx::query(
                "INSERT INTO errors
                    (fingerprint, kind, error_class, message, occurrences_count,
                     first_occurred_at, last_occurred_at, contexts, occurrence_buckets)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    occurrences_count = errors.occurrences_count + excluded.occurrences_count,
                    first_occurred_at = min(errors.first_occurred_at, excluded.first_occurred_at),
                    last_occurred_at = max(errors.last_occurred_at, excluded.last_occurred_at),
                    message = excluded.message,
                    contexts = excluded.contexts,
                    occurrence_buckets = excluded.occurrence_buckets",
            )
            .bind(&e.fingerprint)
            .bind(e.kind.as_str())
            .bind(&e.error_class)
            .bind(&e.message)
            .bind(e.occurrences.len() as i64)
            .bind(first_at)
            .bind(last_at)
            .bind(merged_contexts_json)
            .bind(merged_buckets_json)
            .execute(&mut *tx)
            .await
            .map_err(|err| Error::PersistFailure(format!("upsert error: {err}")))?;
        }

        tx.commit().await.map_err(|e| Error::PersistFailure(format!("commit errors: {e}")))?;
        Ok(())
    }

    async fn persist_event_buckets(&self, rows: &[EventBucketRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        for r in rows {
            sqlx::query(
                "INSERT INTO event_buckets (name, bucket_start, count) VALUES (?, ?, ?)
                 ON CONFLICT(name, bucket_start) DO UPDATE SET count = event_buckets.count + excluded.count",
            )
            .bind(&r.name)
            .bind(r.bucket_start)
            .bind(r.count as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("upsert event bucket: {e}")))?;
        }

        tx.commit().await.map_err(|e| Error::PersistFailure(format!("commit event buckets: {e}")))?;
        Ok(())
    }

    async fn persist_event_samples(&self, rows: &[EventSampleRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        for r in rows {
            let payload_json = r.payload.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default());
            sqlx::query("INSERT INTO event_samples (name, payload, recorded_at) VALUES (?, ?, ?)")
                .bind(&r.name)
                .bind(payload_json)
                .bind(r.recorded_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::PersistFailure(format!("insert event sample: {e}")))?;
        }

        tx.commit().await.map_err(|e| Error::PersistFailure(format!("commit event samples: {e}")))?;
        Ok(())
    }

    async fn downsample(&self, tier: DownsampleTier, now: DateTime<Utc>) -> Result<DownsampleStats> {
        let threshold = now - chrono::Duration::from_std(tier.age_threshold).unwrap_or_default();
        let interval_secs = tier.target_interval.as_secs().max(1) as i64;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        let candidates = sqlx::query(
            "SELECT id, kind, target, operation, bucket_start, count, success_count, failure_count,
                    duration_sum, duration_max, duration_min, metadata_sum, p95_digest
             FROM buckets WHERE bucket_start < ?",
        )
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::PersistFailure(format!("downsample scan: {e}")))?;

        let mut groups: HashMap<(String, String, String, i64), Vec<sqlx::sqlite::SqliteRow>> = HashMap::new();
        for row in candidates {
            let kind: String = row.try_get("kind").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let target: String = row.try_get("target").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let operation: String = row.try_get("operation").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let bucket_start: DateTime<Utc> =
                row.try_get("bucket_start").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let aligned = apmcore::merge::align_epoch(bucket_start.timestamp(), chrono::Duration::seconds(interval_secs));
            groups.entry((kind, target, operation, aligned)).or_default().push(row);
        }

        let mut stats = DownsampleStats::default();
        for ((kind, target, operation, aligned), rows) in groups {
            stats.groups_considered += 1;
            if rows.len() < 2 {
                continue;
            }
            let mut count = 0i64;
            let mut success_count = 0i64;
            let mut failure_count = 0i64;
            let mut duration_sum = 0f64;
            let mut duration_max = f64::MIN;
            let mut duration_min = f64::MAX;
            let mut ids = Vec::with_capacity(rows.len());
            let mut merged_metadata = HashMap::new();
            let mut merged_digest_bytes = apmcore::digest::TDigest::new(100.0).serialize();
            for row in &rows {
                ids.push(row.try_get::<i64, _>("id").map_err(|e| Error::PersistFailure(e.to_string()))?);
                count += row.try_get::<i64, _>("count").map_err(|e| Error::PersistFailure(e.to_string()))?;
                success_count += row.try_get::<i64, _>("success_count").map_err(|e| Error::PersistFailure(e.to_string()))?;
                failure_count += row.try_get::<i64, _>("failure_count").map_err(|e| Error::PersistFailure(e.to_string()))?;
                duration_sum += row.try_get::<f64, _>("duration_sum").map_err(|e| Error::PersistFailure(e.to_string()))?;
                duration_max = duration_max.max(row.try_get::<f64, _>("duration_max").map_err(|e| Error::PersistFailure(e.to_string()))?);
                duration_min = duration_min.min(row.try_get::<f64, _>("duration_min").map_err(|e| Error::PersistFailure(e.to_string()))?);

                let metadata_json: String = row.try_get("metadata_sum").unwrap_or_else(|_| "{}".to_string());
                let row_metadata: HashMap<String, f64> = serde_json::from_str(&metadata_json).unwrap_or_default();
                merged_metadata = merge_metadata_sum(&merged_metadata, &row_metadata);
                let row_digest_bytes: Vec<u8> = row.try_get("p95_digest").unwrap_or_default();
                merged_digest_bytes = merge_digest(&merged_digest_bytes, &row_digest_bytes);
            }
            let aligned_ts = DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(now);

            sqlx::query(
                "INSERT INTO buckets (kind, target, operation, bucket_start, count, success_count,
                     failure_count, duration_sum, duration_max, duration_min, metadata_sum, p95_digest)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', x'')
                 ON CONFLICT(kind, target, operation, bucket_start) DO UPDATE SET
                    count = buckets.count + excluded.count,
                    success_count = buckets.success_count + excluded.success_count,
                    failure_count = buckets.failure_count + excluded.failure_count,
                    duration_sum = buckets.duration_sum + excluded.duration_sum,
                    duration_max = max(buckets.duration_max, excluded.duration_max),
                    duration_min = min(buckets.duration_min, excluded.duration_min)",
            )
            .bind(&kind)
            .bind(&target)
            .bind(&operation)
            .bind(aligned_ts)
            .bind(count)
            .bind(success_count)
            .bind(failure_count)
            .bind(duration_sum)
            .bind(duration_max)
            .bind(duration_min)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("downsample survivor upsert: {e}")))?;

            let survivor = sqlx::query(
                "SELECT id, metadata_sum, p95_digest FROM buckets
                 WHERE kind = ? AND target = ? AND operation = ? AND bucket_start = ?",
            )
            .bind(&kind)
            .bind(&target)
            .bind(&operation)
            .bind(aligned_ts)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("fetch survivor for merge: {e}")))?;

            let survivor_id: i64 = survivor.try_get("id").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let existing_metadata_json: String =
                survivor.try_get("metadata_sum").unwrap_or_else(|_| "{}".to_string());
            let existing_metadata: HashMap<String, f64> =
                serde_json::from_str(&existing_metadata_json).unwrap_or_default();
            let existing_digest_bytes: Vec<u8> = survivor.try_get("p95_digest").unwrap_or_default();

            let final_metadata = merge_metadata_sum(&existing_metadata, &merged_metadata);
            let final_digest_bytes = merge_digest(&existing_digest_bytes, &merged_digest_bytes);
            let final_metadata_json = serde_json::to_string(&final_metadata)
                .map_err(|e| Error::SerializationError(format!("metadata_sum: {e}")))?;

            sqlx::query("UPDATE buckets SET metadata_sum = ?, p95_digest = ? WHERE id = ?")
                .bind(final_metadata_json)
                .bind(final_digest_bytes)
                .bind(survivor_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::PersistFailure(format!("update survivor merge fields: {e}")))?;

            for id in &ids {
                sqlx::query("DELETE FROM buckets WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::PersistFailure(format!("downsample delete: {e}")))?;
            }

            stats.buckets_merged += 1;
            stats.buckets_deleted += ids.len() as u64;
        }

        tx.commit().await.map_err(|e| Error::PersistFailure(format!("commit downsample: {e}")))?;
        Ok(stats)
    }

    async fn apply_retention(
        &self,
        retention: std::time::Duration,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<RetentionStats> {
        let threshold = now - chrono::Duration::from_std(retention).unwrap_or_default();
        let mut stats = RetentionStats::default();

        loop {
            let deleted = sqlx::query(
                "DELETE FROM buckets WHERE id IN (SELECT id FROM buckets WHERE bucket_start < ? LIMIT ?)",
            )
            .bind(threshold)
            .bind(batch_size as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::PersistFailure(format!("retention buckets: {e}")))?
            .rows_affected();
            stats.buckets_deleted += deleted;
            if deleted < batch_size as u64 {
                break;
            }
        }

        stats.samples_deleted = sqlx::query(
            "DELETE FROM samples WHERE id IN (SELECT id FROM samples WHERE recorded_at < ? LIMIT ?)",
        )
        .bind(threshold)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::PersistFailure(format!("retention samples: {e}")))?
        .rows_affected();

        stats.errors_deleted = sqlx::query(
            "DELETE FROM errors WHERE id IN (SELECT id FROM errors WHERE last_occurred_at < ? LIMIT ?)",
        )
        .bind(threshold)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::PersistFailure(format!("retention errors: {e}")))?
        .rows_affected();

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apmcore::digest::TDigest;
    use apmcore::event::{Kind, SampleType};

    const SCHEMA: &str = "
        CREATE TABLE buckets (
            id INTEGER PRIMARY KEY, kind TEXT, target TEXT, operation TEXT, bucket_start TIMESTAMP,
            count INTEGER, success_count INTEGER, failure_count INTEGER,
            duration_sum REAL, duration_max REAL, duration_min REAL,
            metadata_sum TEXT, p95_digest BLOB,
            UNIQUE(kind, target, operation, bucket_start)
        );
        CREATE TABLE samples (
            id INTEGER PRIMARY KEY, bucket_id INTEGER, kind TEXT, sample_type TEXT,
            recorded_at TIMESTAMP, duration REAL, context TEXT, error_fingerprint TEXT
        );
        CREATE TABLE errors (
            id INTEGER PRIMARY KEY, fingerprint TEXT UNIQUE, kind TEXT, error_class TEXT, message TEXT,
            occurrences_count INTEGER, first_occurred_at TIMESTAMP, last_occurred_at TIMESTAMP,
            contexts TEXT, occurrence_buckets TEXT, resolved_at TIMESTAMP
        );
        CREATE TABLE event_buckets (
            id INTEGER PRIMARY KEY, name TEXT, bucket_start TIMESTAMP, count INTEGER,
            UNIQUE(name, bucket_start)
        );
        CREATE TABLE event_samples (
            id INTEGER PRIMARY KEY, name TEXT, payload TEXT, recorded_at TIMESTAMP
        );
    ";

    async fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::connect(":memory:", Duration::from_secs(5)).await.unwrap();
        sqlx::raw_sql(SCHEMA).execute(adapter.pool()).await.unwrap();
        adapter
    }

    fn bucket_group(target: &str, bucket_start: DateTime<Utc>) -> BucketGroup {
        let mut digest = TDigest::new(100.0);
        digest.add(12.0);
        BucketGroup {
            key: BucketKey {
                kind: Kind::Http,
                target: target.to_string(),
                operation: "GET".to_string(),
                bucket_start,
            },
            count: 3,
            success_count: 3,
            failure_count: 0,
            duration_sum: 36.0,
            duration_max: 20.0,
            duration_min: 8.0,
            metadata_sum: HashMap::from([("db_count".to_string(), 2.0)]),
            digest,
        }
    }

    #[tokio::test]
    async fn persist_buckets_upserts_additively_across_two_calls() {
        let adapter = adapter().await;
        let bucket_start = Utc::now();
        let group = bucket_group("UsersController#index", bucket_start);

        let ids_first = adapter.persist_buckets(&[group.clone()]).await.unwrap();
        let ids_second = adapter.persist_buckets(&[group.clone()]).await.unwrap();
        assert_eq!(ids_first.get(&group.key), ids_second.get(&group.key));

        let row = sqlx::query("SELECT count, metadata_sum FROM buckets WHERE target = ?")
            .bind("UsersController#index")
            .fetch_one(adapter.pool())
            .await
            .unwrap();
        let count: i64 = row.try_get("count").unwrap();
        assert_eq!(count, 6);
        let metadata: String = row.try_get("metadata_sum").unwrap();
        assert!(metadata.contains("4"));
    }

    #[tokio::test]
    async fn persist_samples_skips_rows_with_unknown_bucket_id() {
        let adapter = adapter().await;
        let bucket_start = Utc::now();
        let group = bucket_group("OrdersController#show", bucket_start);
        let ids = adapter.persist_buckets(&[group.clone()]).await.unwrap();

        let known = SampleRow {
            bucket_key: group.key.clone(),
            sample_type: SampleType::Slow,
            recorded_at: Utc::now(),
            duration_ms: 500.0,
            context: None,
            error_fingerprint: None,
        };
        let mut unknown_key = group.key.clone();
        unknown_key.target = "Missing#nowhere".to_string();
        let unknown = SampleRow {
            bucket_key: unknown_key,
            ..known.clone()
        };

        adapter.persist_samples(&[known, unknown], &ids).await.unwrap();

        let row = sqlx::query("SELECT count(*) as n FROM samples").fetch_one(adapter.pool()).await.unwrap();
        let n: i64 = row.try_get("n").unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn persist_errors_merges_occurrence_counts() {
        let adapter = adapter().await;
        let now = Utc::now();
        let group = ErrorGroup {
            fingerprint: "deadbeef".repeat(8),
            kind: Kind::Http,
            error_class: "ActiveRecord::RecordNotFound".to_string(),
            message: "Couldn't find User".to_string(),
            occurrences: vec![now],
            contexts: vec![serde_json::json!({"id": 1})],
        };
        adapter.persist_errors(&[group.clone()]).await.unwrap();
        adapter.persist_errors(&[group]).await.unwrap();

        let row = sqlx::query("SELECT occurrences_count FROM errors WHERE fingerprint = ?")
            .bind("deadbeef".repeat(8))
            .fetch_one(adapter.pool())
            .await
            .unwrap();
        let n: i64 = row.try_get("occurrences_count").unwrap();
        assert_eq!(n, 2);
    }

    /// Five one-minute buckets, each carrying its own `metadata_sum`/digest
    /// contribution, collapse into one survivor on downsample — the
    /// survivor's merged metadata/digest must reflect all five, not just the
    /// scalar count.
    #[tokio::test]
    async fn downsample_merges_metadata_sum_and_digest_across_survivors() {
        use chrono::TimeZone;

        let adapter = adapter().await;
        let window_start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();

        for minute in 0..5 {
            let group = bucket_group("UsersController#index", window_start + chrono::Duration::minutes(minute));
            adapter.persist_buckets(&[group]).await.unwrap();
        }

        let tier = DownsampleTier {
            target_interval: Duration::from_secs(5 * 60),
            age_threshold: Duration::from_secs(3600),
        };
        let now = window_start + chrono::Duration::hours(2);
        let stats = adapter.downsample(tier, now).await.unwrap();
        assert_eq!(stats.buckets_merged, 1);
        assert_eq!(stats.buckets_deleted, 5);

        let row = sqlx::query("SELECT count, metadata_sum, p95_digest FROM buckets WHERE target = ?")
            .bind("UsersController#index")
            .fetch_one(adapter.pool())
            .await
            .unwrap();
        let count: i64 = row.try_get("count").unwrap();
        assert_eq!(count, 15);
        let metadata_json: String = row.try_get("metadata_sum").unwrap();
        let metadata: HashMap<String, f64> = serde_json::from_str(&metadata_json).unwrap();
        assert_eq!(metadata.get("db_count").copied(), Some(10.0));
        let digest_bytes: Vec<u8> = row.try_get("p95_digest").unwrap();
        let mut digest = TDigest::deserialize(&digest_bytes).unwrap();
        assert!(digest.quantile(0.5) > 0.0);
    }
}
