//! Set-based PostgreSQL `PersistenceAdapter` (spec.md §4.5, variant 1).
//!
//! Scalar additive fields (`count`, `success_count`, `failure_count`,
//! `duration_sum`) and extrema (`duration_max`/`duration_min`) are upserted
//! in one batch statement per call using `UNNEST` to fan an array of rows
//! through a single `INSERT ... ON CONFLICT DO UPDATE`, with `GREATEST`/
//! `LEAST` doing the extrema merge server-side. `metadata_sum`, `p95_digest`
//! and error contexts/histograms need custom merge logic the database can't
//! express, so those go through a read-modify-write per row, each row
//! serialized on a `pg_advisory_xact_lock` keyed by a hash of its unique
//! tuple — two flushers from different processes block each other only on
//! the same bucket, never on the whole table.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};

use apmcore::config::DownsampleTier;
use apmcore::digest::TDigest;
use apmcore::error::{Error, Result};
use apmcore::event::Kind;
use apmcore::merge::{merge_contexts, merge_digest, merge_metadata_sum, merge_occurrence_buckets, OccurrenceBuckets};
use apmcore::persistence::{
    BucketGroup, BucketKey, DownsampleStats, ErrorGroup, EventBucketRow, EventSampleRow, PersistenceAdapter,
    RetentionStats, SampleRow,
};

fn advisory_lock_key(kind: Kind, target: &str, operation: &str, bucket_start: DateTime<Utc>) -> i64 {
    let material = format!("{}:{}:{}:{}", kind.as_str(), target, operation, bucket_start.timestamp());
    xxhash_rust::xxh3::xxh3_64(material.as_bytes()) as i64
}

pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| Error::PersistFailure(format!("postgres connect: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn merge_bucket_row(
        tx: &mut Transaction<'_, Postgres>,
        key: &BucketKey,
        metadata_delta: &HashMap<String, f64>,
        digest_delta: &TDigest,
    ) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key(key.kind, &key.target, &key.operation, key.bucket_start))
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("advisory lock: {e}")))?;

        let row = sqlx::query(
            "SELECT metadata_sum, p95_digest FROM buckets
             WHERE kind = $1 AND target = $2 AND operation = $3 AND bucket_start = $4",
        )
        .bind(key.kind.as_str())
        .bind(&key.target)
        .bind(&key.operation)
        .bind(key.bucket_start)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| Error::PersistFailure(format!("fetch bucket for merge: {e}")))?;

        let existing_metadata: HashMap<String, f64> = row
            .try_get::<sqlx::types::Json<HashMap<String, f64>>, _>("metadata_sum")
            .map(|j| j.0)
            .unwrap_or_default();
        let existing_digest_bytes: Vec<u8> = row.try_get("p95_digest").unwrap_or_default();

        let merged_metadata = merge_metadata_sum(&existing_metadata, metadata_delta);
        let merged_digest_bytes = merge_digest(&existing_digest_bytes, &digest_delta.serialize());

        sqlx::query(
            "UPDATE buckets SET metadata_sum = $1, p95_digest = $2
             WHERE kind = $3 AND target = $4 AND operation = $5 AND bucket_start = $6",
        )
        .bind(sqlx::types::Json(merged_metadata))
        .bind(merged_digest_bytes)
        .bind(key.kind.as_str())
        .bind(&key.target)
        .bind(&key.operation)
        .bind(key.bucket_start)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::PersistFailure(format!("update bucket merge fields: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for PostgresAdapter {
    async fn persist_buckets(&self, groups: &[BucketGroup]) -> Result<HashMap<BucketKey, i64>> {
        if groups.is_empty() {
            return Ok(HashMap::new());
        }

        let kinds: Vec<&str> = groups.iter().map(|g| g.key.kind.as_str()).collect();
        let targets: Vec<&str> = groups.iter().map(|g| g.key.target.as_str()).collect();
        let operations: Vec<&str> = groups.iter().map(|g| g.key.operation.as_str()).collect();
        let bucket_starts: Vec<DateTime<Utc>> = groups.iter().map(|g| g.key.bucket_start).collect();
        let counts: Vec<i64> = groups.iter().map(|g| g.count as i64).collect();
        let success_counts: Vec<i64> = groups.iter().map(|g| g.success_count as i64).collect();
        let failure_counts: Vec<i64> = groups.iter().map(|g| g.failure_count as i64).collect();
        let duration_sums: Vec<f64> = groups.iter().map(|g| g.duration_sum).collect();
        let duration_maxes: Vec<f64> = groups.iter().map(|g| g.duration_max).collect();
        let duration_mins: Vec<f64> = groups.iter().map(|g| g.duration_min).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        let rows = sqlx::query(
            "INSERT INTO buckets
                (kind, target, operation, bucket_start, count, success_count, failure_count,
                 duration_sum, duration_max, duration_min, metadata_sum, p95_digest)
             SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::timestamptz[],
                $5::bigint[], $6::bigint[], $7::bigint[],
                $8::double precision[], $9::double precision[], $10::double precision[]
             ) AS t(kind, target, operation, bucket_start, count, success_count, failure_count,
                    duration_sum, duration_max, duration_min)
             CROSS JOIN LATERAL (SELECT '{}'::jsonb AS metadata_sum, ''::bytea AS p95_digest) empty
             ON CONFLICT (kind, target, operation, bucket_start) DO UPDATE SET
                count = buckets.count + EXCLUDED.count,
                success_count = buckets.success_count + EXCLUDED.success_count,
                failure_count = buckets.failure_count + EXCLUDED.failure_count,
                duration_sum = buckets.duration_sum + EXCLUDED.duration_sum,
                duration_max = GREATEST(buckets.duration_max, EXCLUDED.duration_max),
                duration_min = LEAST(buckets.duration_min, EXCLUDED.duration_min)
             RETURNING id, kind, target, operation, bucket_start",
        )
        .bind(&kinds)
        .bind(&targets)
        .bind(&operations)
        .bind(&bucket_starts)
        .bind(&counts)
        .bind(&success_counts)
        .bind(&failure_counts)
        .bind(&duration_sums)
        .bind(&duration_maxes)
        .bind(&duration_mins)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::PersistFailure(format!("batch upsert buckets: {e}")))?;

        let mut ids = HashMap::with_capacity(groups.len());
        for row in &rows {
            let kind: String = row.try_get("kind").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let key = BucketKey {
                kind: kind.parse().map_err(Error::SerializationError)?,
                target: row.try_get("target").map_err(|e| Error::PersistFailure(e.to_string()))?,
                operation: row.try_get("operation").map_err(|e| Error::PersistFailure(e.to_string()))?,
                bucket_start: row.try_get("bucket_start").map_err(|e| Error::PersistFailure(e.to_string()))?,
            };
            let id: i64 = row.try_get("id").map_err(|e| Error::PersistFailure(e.to_string()))?;
            ids.insert(key, id);
        }

        for g in groups {
            Self::merge_bucket_row(&mut tx, &g.key, &g.metadata_sum, &g.digest).await?;
        }

        tx.commit().await.map_err(|e| Error::PersistFailure(format!("commit buckets: {e}")))?;
        Ok(ids)
    }

    async fn persist_samples(&self, samples: &[SampleRow], bucket_ids: &HashMap<BucketKey, i64>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut bucket_id = Vec::with_capacity(samples.len());
        let mut kind = Vec::with_capacity(samples.len());
        let mut sample_type = Vec::with_capacity(samples.len());
        let mut recorded_at = Vec::with_capacity(samples.len());
        let mut duration = Vec::with_capacity(samples.len());
        let mut context = Vec::with_capacity(samples.len());
        let mut error_fingerprint = Vec::with_capacity(samples.len());

        for s in samples {
            // spec §7 sampleBucketMissing: skip, never fail the batch.
            let Some(id) = bucket_ids.get(&s.bucket_key) else {
                tracing::warn!(target = %s.bucket_key.target, "sample's bucket id missing, skipping row");
                continue;
            };
            bucket_id.push(*id);
            kind.push(s.bucket_key.kind.as_str());
            sample_type.push(s.sample_type.as_str());
            recorded_at.push(s.recorded_at);
            duration.push(s.duration_ms);
            context.push(s.context.clone().map(sqlx::types::Json));
            error_fingerprint.push(s.error_fingerprint.clone());
        }
        if bucket_id.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO samples (bucket_id, kind, sample_type, recorded_at, duration, context, error_fingerprint)
             SELECT * FROM UNNEST(
                $1::bigint[], $2::text[], $3::text[], $4::timestamptz[], $5::double precision[],
                $6::jsonb[], $7::text[]
             )",
        )
        .bind(&bucket_id)
        .bind(&kind)
        .bind(&sample_type)
        .bind(&recorded_at)
        .bind(&duration)
        .bind(context as Vec<Option<sqlx::types::Json<serde_json::Value>>>)
        .bind(&error_fingerprint)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::PersistFailure(format!("insert samples: {e}")))?;

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
            let lock_key = xxhash_rust::xxh3::xxh3_64(e.fingerprint.as_bytes()) as i64;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(lock_key)
                .execute(&mut *tx)
                .await
                .map_err(|err| Error::PersistFailure(format!("advisory lock: {err}")))?;

            let first_at = e.occurrences.iter().min().copied();
            let last_at = e.occurrences.iter().max().copied();
            let now = last_at.unwrap_or_else(Utc::now);

            let existing = sqlx::query(
                "SELECT contexts, occurrence_buckets FROM errors WHERE fingerprint = $1",
            )
            .bind(&e.fingerprint)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| Error::PersistFailure(format!("fetch error row: {err}")))?;

            let (existing_contexts, existing_buckets) = match existing {
                Some(row) => {
                    let contexts: Vec<serde_json::Value> = row
                        .try_get::<sqlx::types::Json<Vec<serde_json::Value>>, _>("contexts")
                        .map(|j| j.0)
                        .unwrap_or_default();
                    let buckets: OccurrenceBuckets = row
                        .try_get::<sqlx::types::Json<OccurrenceBuckets>, _>("occurrence_buckets")
                        .map(|j| j.0)
                        .unwrap_or_default();
                    (contexts, buckets)
                }
                None => (Vec::new(), OccurrenceBuckets::default()),
            };

            let merged_contexts = merge_contexts(&existing_contexts, &e.contexts, 20);
            let merged_buckets = merge_occurrence_buckets(&existing_buckets, &e.occurrences, now);

            sqlx::query(
                "INSERT INTO errors
                    (fingerprint, kind, error_class, message, occurrences_count,
                     first_occurred_at, last_occurred_at, contexts, occurrence_buckets)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (fingerprint) DO UPDATE SET
                    occurrences_count = errors.occurrences_count + EXCLUDED.occurrences_count,
                    first_occurred_at = LEAST(errors.first_occurred_at, EXCLUDED.first_occurred_at),
                    last_occurred_at = GREATEST(errors.last_occurred_at, EXCLUDED.last_occurred_at),
                    message = EXCLUDED.message,
                    contexts = EXCLUDED.contexts,
                    occurrence_buckets = EXCLUDED.occurrence_buckets",
            )
            .bind(&e.fingerprint)
            .bind(e.kind.as_str())
            .bind(&e.error_class)
            .bind(&e.message)
            .bind(e.occurrences.len() as i64)
            .bind(first_at)
            .bind(last_at)
            .bind(sqlx::types::Json(merged_contexts))
            .bind(sqlx::types::Json(merged_buckets))
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
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let bucket_starts: Vec<DateTime<Utc>> = rows.iter().map(|r| r.bucket_start).collect();
        let counts: Vec<i64> = rows.iter().map(|r| r.count as i64).collect();

        sqlx::query(
            "INSERT INTO event_buckets (name, bucket_start, count)
             SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::bigint[])
             ON CONFLICT (name, bucket_start) DO UPDATE SET
                count = event_buckets.count + EXCLUDED.count",
        )
        .bind(&names)
        .bind(&bucket_starts)
        .bind(&counts)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::PersistFailure(format!("upsert event buckets: {e}")))?;

        Ok(())
    }

    async fn persist_event_samples(&self, rows: &[EventSampleRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let payloads: Vec<Option<sqlx::types::Json<serde_json::Value>>> =
            rows.iter().map(|r| r.payload.clone().map(sqlx::types::Json)).collect();
        let recorded_ats: Vec<DateTime<Utc>> = rows.iter().map(|r| r.recorded_at).collect();

        sqlx::query(
            "INSERT INTO event_samples (name, payload, recorded_at)
             SELECT * FROM UNNEST($1::text[], $2::jsonb[], $3::timestamptz[])",
        )
        .bind(&names)
        .bind(payloads)
        .bind(&recorded_ats)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::PersistFailure(format!("insert event samples: {e}")))?;

        Ok(())
    }

    async fn downsample(&self, tier: DownsampleTier, now: DateTime<Utc>) -> Result<DownsampleStats> {
        let threshold = now - chrono::Duration::from_std(tier.age_threshold).unwrap_or_default();
        let interval_secs = tier.target_interval.as_secs().max(1) as f64;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::PersistFailure(format!("begin transaction: {e}")))?;

        let groups = sqlx::query(
            "SELECT kind, target, operation,
                    to_timestamp(floor(extract(epoch from bucket_start) / $1) * $1) AS aligned,
                    array_agg(id ORDER BY id) AS ids,
                    array_agg(metadata_sum ORDER BY id) AS metadata_sums,
                    array_agg(p95_digest ORDER BY id) AS digests,
                    sum(count) AS count, sum(success_count) AS success_count, sum(failure_count) AS failure_count,
                    sum(duration_sum) AS duration_sum, max(duration_max) AS duration_max, min(duration_min) AS duration_min
             FROM buckets
             WHERE bucket_start < $2
             GROUP BY kind, target, operation, aligned
             HAVING count(*) >= 2",
        )
        .bind(interval_secs)
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::PersistFailure(format!("downsample scan: {e}")))?;

        let mut stats = DownsampleStats::default();
        for row in groups {
            stats.groups_considered += 1;
            let ids: Vec<i64> = row.try_get("ids").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let aligned: DateTime<Utc> = row.try_get("aligned").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let kind: String = row.try_get("kind").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let target: String = row.try_get("target").map_err(|e| Error::PersistFailure(e.to_string()))?;
            let operation: String = row.try_get("operation").map_err(|e| Error::PersistFailure(e.to_string()))?;

            let metadata_sums: Vec<sqlx::types::Json<HashMap<String, f64>>> = row
                .try_get("metadata_sums")
                .map_err(|e| Error::PersistFailure(e.to_string()))?;
            let digests: Vec<Vec<u8>> = row.try_get("digests").map_err(|e| Error::PersistFailure(e.to_string()))?;

            let mut merged_metadata = HashMap::new();
            for m in &metadata_sums {
                merged_metadata = merge_metadata_sum(&merged_metadata, &m.0);
            }
            let mut merged_digest_bytes = TDigest::new(100.0).serialize();
            for d in &digests {
                merged_digest_bytes = merge_digest(&merged_digest_bytes, d);
            }
            let merged_digest = TDigest::deserialize(&merged_digest_bytes).unwrap_or_else(|_| TDigest::new(100.0));

            sqlx::query(
                "INSERT INTO buckets (kind, target, operation, bucket_start, count, success_count,
                     failure_count, duration_sum, duration_max, duration_min, metadata_sum, p95_digest)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, '{}'::jsonb, ''::bytea)
                 ON CONFLICT (kind, target, operation, bucket_start) DO UPDATE SET
                    count = buckets.count + EXCLUDED.count,
                    success_count = buckets.success_count + EXCLUDED.success_count,
                    failure_count = buckets.failure_count + EXCLUDED.failure_count,
                    duration_sum = buckets.duration_sum + EXCLUDED.duration_sum,
                    duration_max = GREATEST(buckets.duration_max, EXCLUDED.duration_max),
                    duration_min = LEAST(buckets.duration_min, EXCLUDED.duration_min)",
            )
            .bind(&kind)
            .bind(&target)
            .bind(&operation)
            .bind(aligned)
            .bind(row.try_get::<i64, _>("count").map_err(|e| Error::PersistFailure(e.to_string()))?)
            .bind(row.try_get::<i64, _>("success_count").map_err(|e| Error::PersistFailure(e.to_string()))?)
            .bind(row.try_get::<i64, _>("failure_count").map_err(|e| Error::PersistFailure(e.to_string()))?)
            .bind(row.try_get::<f64, _>("duration_sum").map_err(|e| Error::PersistFailure(e.to_string()))?)
            .bind(row.try_get::<f64, _>("duration_max").map_err(|e| Error::PersistFailure(e.to_string()))?)
            .bind(row.try_get::<f64, _>("duration_min").map_err(|e| Error::PersistFailure(e.to_string()))?)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::PersistFailure(format!("downsample survivor upsert: {e}")))?;

            let survivor_key = BucketKey {
                kind: kind.parse().map_err(Error::SerializationError)?,
                target,
                operation,
                bucket_start: aligned,
            };
            Self::merge_bucket_row(&mut tx, &survivor_key, &merged_metadata, &merged_digest).await?;

            sqlx::query("DELETE FROM buckets WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::PersistFailure(format!("downsample delete: {e}")))?;

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
                "DELETE FROM buckets WHERE id IN
                    (SELECT id FROM buckets WHERE bucket_start < $1 LIMIT $2)",
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
            "DELETE FROM samples WHERE id IN
                (SELECT id FROM samples WHERE recorded_at < $1 LIMIT $2)",
        )
        .bind(threshold)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::PersistFailure(format!("retention samples: {e}")))?
        .rows_affected();

        stats.errors_deleted = sqlx::query(
            "DELETE FROM errors WHERE id IN
                (SELECT id FROM errors WHERE last_occurred_at < $1 LIMIT $2)",
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

    #[test]
    fn advisory_lock_key_is_stable_for_same_tuple() {
        let start = Utc::now();
        let a = advisory_lock_key(Kind::Http, "UsersController#show", "GET", start);
        let b = advisory_lock_key(Kind::Http, "UsersController#show", "GET", start);
        assert_eq!(a, b);
    }

    #[test]
    fn advisory_lock_key_differs_across_targets() {
        let start = Utc::now();
        let a = advisory_lock_key(Kind::Http, "UsersController#show", "GET", start);
        let b = advisory_lock_key(Kind::Http, "OrdersController#show", "GET", start);
        assert_ne!(a, b);
    }

    /// Opens a pool against `TEST_DATABASE_URL`/`DATABASE_URL`, or `None` if
    /// neither is set — the downsample test below needs a real server.
    async fn pool_from_env() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")).ok()?;
        PgPoolOptions::new().max_connections(2).connect(&url).await.ok()
    }

    async fn fresh_schema(pool: &PgPool) {
        sqlx::query(
            "DROP TABLE IF EXISTS buckets;
             CREATE TABLE buckets (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                operation TEXT NOT NULL,
                bucket_start TIMESTAMPTZ NOT NULL,
                count BIGINT NOT NULL,
                success_count BIGINT NOT NULL,
                failure_count BIGINT NOT NULL,
                duration_sum DOUBLE PRECISION NOT NULL,
                duration_max DOUBLE PRECISION NOT NULL,
                duration_min DOUBLE PRECISION NOT NULL,
                metadata_sum JSONB NOT NULL DEFAULT '{}',
                p95_digest BYTEA NOT NULL DEFAULT '',
                UNIQUE (kind, target, operation, bucket_start)
             )",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    fn bucket_group(target: &str, bucket_start: DateTime<Utc>, metadata_value: f64) -> BucketGroup {
        let mut digest = TDigest::new(100.0);
        digest.add(12.0);
        BucketGroup {
            key: BucketKey {
                kind: Kind::Http,
                target: target.to_string(),
                operation: "GET".to_string(),
                bucket_start,
            },
            count: 10,
            success_count: 10,
            failure_count: 0,
            duration_sum: 100.0,
            duration_max: 15.0,
            duration_min: 5.0,
            metadata_sum: HashMap::from([("db_count".to_string(), metadata_value)]),
            digest,
        }
    }

    /// Five one-minute buckets, each carrying its own `metadata_sum`/digest
    /// contribution, collapse into one survivor on downsample — and the
    /// survivor's merged metadata/digest must reflect all five, not just the
    /// scalar count (spec §4.7's digest-union / metadata-additive rule).
    #[tokio::test]
    #[ignore = "requires a reachable Postgres instance (TEST_DATABASE_URL/DATABASE_URL)"]
    async fn downsample_merges_metadata_sum_and_digest_across_survivors() {
        use chrono::TimeZone;

        let Some(pool) = pool_from_env().await else { return };
        fresh_schema(&pool).await;
        let adapter = PostgresAdapter::new(pool);
        let window_start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();

        for minute in 0..5 {
            let group = bucket_group(
                "UsersController#index",
                window_start + chrono::Duration::minutes(minute),
                2.0,
            );
            adapter.persist_buckets(&[group]).await.unwrap();
        }

        let tier = DownsampleTier {
            target_interval: std::time::Duration::from_secs(5 * 60),
            age_threshold: std::time::Duration::from_secs(3600),
        };
        let stats = adapter.downsample(tier, Utc::now()).await.unwrap();
        assert_eq!(stats.buckets_merged, 1);
        assert_eq!(stats.buckets_deleted, 5);

        let row = sqlx::query("SELECT count, metadata_sum, p95_digest FROM buckets WHERE target = $1")
            .bind("UsersController#index")
            .fetch_one(adapter.pool())
            .await
            .unwrap();
        let count: i64 = row.try_get("count").unwrap();
        assert_eq!(count, 50);
        let metadata: sqlx::types::Json<HashMap<String, f64>> = row.try_get("metadata_sum").unwrap();
        assert_eq!(metadata.0.get("db_count").copied(), Some(10.0));
        let digest_bytes: Vec<u8> = row.try_get("p95_digest").unwrap();
        let mut digest = TDigest::deserialize(&digest_bytes).unwrap();
        assert!(digest.quantile(0.5) > 0.0);
    }
}
