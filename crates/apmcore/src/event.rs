//! Shared event data types (spec §3).
//!
//! An `Event` owns its payload exclusively until `Buffer::push`; ownership
//! then transfers to the buffer and, on drain, to the flusher.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The three event kinds the core aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Http,
    Job,
    Custom,
}

impl Kind {
    /// Lowercase wire string used in bucket keys and fingerprint input.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Http => "http",
            Kind::Job => "job",
            Kind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Kind::Http),
            "job" => Ok(Kind::Job),
            "custom" => Ok(Kind::Custom),
            other => Err(format!("unknown kind: {other}")),
        }
    }
}

/// Why an event was sampled (i.e. given a non-`None` `sample_type` and a
/// materialized `context`). `None` means the event contributed only to
/// bucket aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    Slow,
    Error,
    Random,
}

impl SampleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleType::Slow => "slow",
            SampleType::Error => "error",
            SampleType::Random => "random",
        }
    }
}

/// An exception captured verbatim from the host, never filtered (spec §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub class: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

/// One normalized operation observed by the Collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: Kind,
    /// Controller#action / job class / user label.
    pub target: String,
    /// HTTP verb / queue / user verb. May be empty.
    pub operation: String,
    pub duration_ms: f64,
    pub started_at: DateTime<Utc>,
    pub status: Option<i32>,
    /// Additive across merges; non-numeric values are dropped at insertion.
    pub metadata: HashMap<String, f64>,
    /// Present only on sampled events.
    pub context: Option<serde_json::Value>,
    pub sample_type: Option<SampleType>,
    pub error: Option<ErrorPayload>,
    /// `started_at` truncated to the configured base granularity. Computed
    /// once at construction time — never recomputed during aggregation
    /// (spec §4.4's tie-break rule).
    pub bucket_start: DateTime<Utc>,
}

impl Event {
    /// Builds an `Event`, computing `bucket_start` by truncating
    /// `started_at` down to `granularity` (spec §3).
    pub fn new(
        kind: Kind,
        target: impl Into<String>,
        operation: impl Into<String>,
        duration_ms: f64,
        started_at: DateTime<Utc>,
        granularity: Duration,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            operation: operation.into(),
            duration_ms,
            started_at,
            status: None,
            metadata: HashMap::new(),
            context: None,
            sample_type: None,
            error: None,
            bucket_start: truncate_to(started_at, granularity),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some() || matches!(self.status, Some(code) if code >= 500)
    }

    /// Rough in-memory footprint: object-header constant + string bytes +
    /// a JSON-length estimate of metadata/context + per-stackframe cost.
    /// Mirrors the heuristic `Buffer::push` relies on (spec §4.1).
    pub fn estimated_bytes(&self) -> usize {
        const HEADER: usize = 96;
        const PER_FRAME: usize = 48;

        let mut n = HEADER + self.target.len() + self.operation.len();
        n += self.metadata.len() * 24; // key/value pair, rough
        if let Some(ctx) = &self.context {
            n += serde_json::to_string(ctx).map(|s| s.len()).unwrap_or(256);
        }
        if let Some(err) = &self.error {
            n += err.class.len() + err.message.len();
            n += err.backtrace.len() * PER_FRAME;
        }
        n
    }
}

/// Truncates `ts` down to the start of the `granularity`-sized window
/// containing it, using whole-second alignment (the base granularity is
/// always a whole number of seconds, e.g. 1 minute).
pub fn truncate_to(ts: DateTime<Utc>, granularity: Duration) -> DateTime<Utc> {
    let secs = granularity.num_seconds().max(1);
    let epoch = ts.timestamp();
    let floored = epoch - epoch.rem_euclid(secs);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}

/// A business-event counter (spec §3). Shares the buffer with `Event` but
/// is never aggregated beyond its count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEvent {
    pub name: String,
    /// Opaque structured payload, never aggregated.
    pub payload: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl CustomEvent {
    pub fn estimated_bytes(&self) -> usize {
        const HEADER: usize = 64;
        let payload_len = self
            .payload
            .as_ref()
            .and_then(|p| serde_json::to_string(p).ok())
            .map(|s| s.len())
            .unwrap_or(0);
        HEADER + self.name.len() + payload_len
    }
}

/// A unit pushed onto the buffer: either a performance `Event` or a
/// counter-style `CustomEvent` (spec §4.9's shared-buffer requirement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BufferItem {
    Event(Event),
    Custom(CustomEvent),
}

impl BufferItem {
    pub fn estimated_bytes(&self) -> usize {
        match self {
            BufferItem::Event(e) => e.estimated_bytes(),
            BufferItem::Custom(c) => c.estimated_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_to_minute() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 15).unwrap();
        let truncated = truncate_to(ts, Duration::minutes(1));
        assert_eq!(truncated, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for k in [Kind::Http, Kind::Job, Kind::Custom] {
            let s = k.to_string();
            assert_eq!(s.parse::<Kind>().unwrap(), k);
        }
    }
}
