//! Pure merge primitives shared by both reference adapters (spec §4.5's
//! `MergeMetadataSum`/`MergeDigest`/`MergeContexts`/`MergeOccurrenceBuckets`).
//!
//! The Postgres adapter calls these inside a per-row advisory-locked
//! read-modify-write; the SQLite adapter calls them inside its single
//! writer transaction. Neither backend re-derives the semantics — this is
//! the one place they live, which is also what keeps the Aggregator
//! adapter-agnostic (spec §9).

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::digest::TDigest;
use crate::error::{Error, Result};

/// Additive per-key float merge.
pub fn merge_metadata_sum(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> HashMap<String, f64> {
    let mut out = a.clone();
    for (k, v) in b {
        *out.entry(k.clone()).or_insert(0.0) += v;
    }
    out
}

/// Unions two serialized TDigests. Malformed input degrades to an empty
/// digest rather than failing the whole merge (spec §7's `digestCorrupt`).
pub fn merge_digest(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut da = TDigest::deserialize(a).unwrap_or_else(|_| TDigest::new(100.0));
    let db = TDigest::deserialize(b).unwrap_or_else(|_| TDigest::new(100.0));
    da.merge(&db);
    da.serialize()
}

/// Appends `new_contexts` (oldest first) to `existing` and trims to `cap`,
/// keeping the most recent entries (FIFO eviction of the oldest).
pub fn merge_contexts(existing: &[Value], new_contexts: &[Value], cap: usize) -> Vec<Value> {
    let mut combined: Vec<Value> = existing.to_vec();
    combined.extend(new_contexts.iter().cloned());
    let start = combined.len().saturating_sub(cap);
    combined.split_off(start)
}

/// Multi-resolution occurrence histogram: minute/hour/day bins, each with
/// its own retention (48h/90d/2y per spec §3/§6), pruned on every merge.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct OccurrenceBuckets {
    #[serde(rename = "m")]
    pub minute: BTreeMap<i64, u64>,
    #[serde(rename = "h")]
    pub hour: BTreeMap<i64, u64>,
    #[serde(rename = "d")]
    pub day: BTreeMap<i64, u64>,
}

const MINUTE_RETENTION: i64 = 48 * 3600;
const HOUR_RETENTION: i64 = 90 * 24 * 3600;
const DAY_RETENTION: i64 = 2 * 365 * 24 * 3600;

impl OccurrenceBuckets {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(v: &Value) -> Result<Self> {
        serde_json::from_value(v.clone())
            .map_err(|e| Error::SerializationError(format!("occurrence histogram: {e}")))
    }
}

/// Folds `new_times` into `existing`'s three bins and prunes entries past
/// each bin's retention, relative to `now`.
pub fn merge_occurrence_buckets(
    existing: &OccurrenceBuckets,
    new_times: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> OccurrenceBuckets {
    let mut out = existing.clone();
    for t in new_times {
        let epoch = t.timestamp();
        *out.minute.entry(floor(epoch, 60)).or_insert(0) += 1;
        *out.hour.entry(floor(epoch, 3600)).or_insert(0) += 1;
        *out.day.entry(floor(epoch, 86400)).or_insert(0) += 1;
    }
    let now_epoch = now.timestamp();
    out.minute.retain(|ts, _| now_epoch - ts <= MINUTE_RETENTION);
    out.hour.retain(|ts, _| now_epoch - ts <= HOUR_RETENTION);
    out.day.retain(|ts, _| now_epoch - ts <= DAY_RETENTION);
    out
}

fn floor(epoch: i64, bucket: i64) -> i64 {
    epoch - epoch.rem_euclid(bucket)
}

/// Back-end expression helper: which modulo alignment a `floor(bucket_start,
/// interval)` SQL expression needs. Adapters translate this into their own
/// `ModuloBucketSQL` (e.g. Postgres's `to_timestamp(floor(extract(epoch
/// from bucket_start) / N) * N)`); kept here only so both adapters agree on
/// the integer semantics of "align to an interval" used by `downsample`.
pub fn align_epoch(epoch_seconds: i64, interval: Duration) -> i64 {
    floor(epoch_seconds, interval.num_seconds().max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_sum_is_additive_and_commutative() {
        let mut a = HashMap::new();
        a.insert("db_count".to_string(), 3.0);
        let mut b = HashMap::new();
        b.insert("db_count".to_string(), 4.0);
        b.insert("cache_count".to_string(), 1.0);

        let ab = merge_metadata_sum(&a, &b);
        let ba = merge_metadata_sum(&b, &a);
        assert_eq!(ab.get("db_count"), Some(&7.0));
        assert_eq!(ab.get("cache_count"), Some(&1.0));
        assert_eq!(ab.get("db_count"), ba.get("db_count"));
    }

    #[test]
    fn digest_merge_is_associative_in_count() {
        let mut a = TDigest::new(100.0);
        for i in 0..100 {
            a.add(i as f64);
        }
        let mut b = TDigest::new(100.0);
        for i in 100..200 {
            b.add(i as f64);
        }
        let mut c = TDigest::new(100.0);
        for i in 200..300 {
            c.add(i as f64);
        }

        let ab_c = merge_digest(&merge_digest(&a.serialize(), &b.serialize()), &c.serialize());
        let a_bc = merge_digest(&a.serialize(), &merge_digest(&b.serialize(), &c.serialize()));
        let d1 = TDigest::deserialize(&ab_c).unwrap();
        let d2 = TDigest::deserialize(&a_bc).unwrap();
        assert_eq!(d1.count(), d2.count());
        assert_eq!(d1.count(), 300);
    }

    #[test]
    fn contexts_trim_keeps_most_recent() {
        let existing = vec![Value::from(1), Value::from(2)];
        let incoming = vec![Value::from(3), Value::from(4), Value::from(5)];
        let merged = merge_contexts(&existing, &incoming, 3);
        assert_eq!(merged, vec![Value::from(3), Value::from(4), Value::from(5)]);
    }

    #[test]
    fn occurrence_buckets_prune_on_merge() {
        let now = Utc::now();
        let old = now - Duration::days(100);
        let recent = now - Duration::minutes(5);
        let folded = merge_occurrence_buckets(&OccurrenceBuckets::default(), &[old, recent], now);
        // `old` is beyond the 48h minute retention and the 90d hour retention,
        // but still within the 2y day retention.
        assert!(folded.minute.values().sum::<u64>() == 1);
        assert!(folded.day.values().sum::<u64>() == 2);
    }
}
