//! Configuration surface (spec §6), enumerated exactly as spec'd, with the
//! defaults the core falls back to when the host supplies none.

use std::collections::HashMap;
use std::time::Duration;

/// Per-kind slow-request threshold override.
pub type SlowThresholdOverrides = HashMap<String, Duration>;

/// A single downsampling tier: roll up buckets at least `age_threshold` old
/// into `target_interval`-sized buckets (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownsampleTier {
    pub target_interval: Duration,
    pub age_threshold: Duration,
}

/// Full configuration surface. Every field here corresponds to a row in
/// spec §6's configuration table. `Default` supplies the documented
/// defaults; constructing via struct literal (as tests do) is always valid.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch; when false every entry point is a no-op.
    pub enabled: bool,

    /// Base bucket granularity `Event::bucket_start` truncates to.
    pub base_granularity: Duration,

    /// Soft ceiling for the Buffer; hard cap is `3 * max_buffer_memory`.
    pub max_buffer_memory: usize,

    pub flush_interval: Duration,
    pub flush_jitter: Duration,

    pub slow_threshold: Duration,
    pub slow_threshold_per_kind: SlowThresholdOverrides,

    /// 1-in-N probability after the endpoint's filling phase ends.
    pub random_sample_rate: u32,
    pub max_random_samples_per_endpoint: u32,
    pub max_slow_samples_per_endpoint: u32,
    pub max_error_samples_per_fingerprint: u32,

    pub max_segments_per_request: usize,
    pub segment_source_threshold: Duration,
    /// Optional per-request byte budget before a checkpoint fires
    /// (`None` disables checkpointing).
    pub segment_memory_limit: Option<usize>,

    pub max_error_contexts: usize,
    /// First K application frames kept when building a fingerprint.
    pub fingerprint_app_frames: usize,

    pub retention_period: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_batch_size: usize,

    pub downsampling_tiers: Vec<DownsampleTier>,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_recovery_timeout: Duration,

    /// Exact, glob (`*`), or regex patterns excluded from collection.
    pub ignored_targets: Vec<String>,
    pub additional_filter_parameters: Vec<String>,

    pub events_enabled: bool,
    pub events_max_samples_per_name: u32,

    pub shutdown_timeout: Duration,

    /// Persistence batch size for adapter bulk operations.
    pub persistence_batch_size: usize,

    /// Re-queue drained events once on persist failure (audited via a
    /// counter) rather than dropping them. Open Question resolution,
    /// see DESIGN.md.
    pub requeue_on_persist_failure: bool,

    /// Stack sampler cadence, only meaningful with the `stack-sampler`
    /// feature enabled.
    pub stack_sampler_interval: Duration,
    /// Hard cap on stack samples retained per request.
    pub hard_sample_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            base_granularity: Duration::from_secs(60),
            max_buffer_memory: 16 * 1024 * 1024,
            flush_interval: Duration::from_secs(60),
            flush_jitter: Duration::from_secs(5),
            slow_threshold: Duration::from_millis(500),
            slow_threshold_per_kind: HashMap::new(),
            random_sample_rate: 100,
            max_random_samples_per_endpoint: 5,
            max_slow_samples_per_endpoint: 5,
            max_error_samples_per_fingerprint: 10,
            max_segments_per_request: 500,
            segment_source_threshold: Duration::from_millis(50),
            segment_memory_limit: Some(2 * 1024 * 1024),
            max_error_contexts: 10,
            fingerprint_app_frames: 5,
            retention_period: Duration::from_secs(90 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            cleanup_batch_size: 1000,
            downsampling_tiers: vec![
                DownsampleTier {
                    target_interval: Duration::from_secs(5 * 60),
                    age_threshold: Duration::from_secs(3600),
                },
                DownsampleTier {
                    target_interval: Duration::from_secs(3600),
                    age_threshold: Duration::from_secs(24 * 3600),
                },
                DownsampleTier {
                    target_interval: Duration::from_secs(24 * 3600),
                    age_threshold: Duration::from_secs(7 * 24 * 3600),
                },
                DownsampleTier {
                    target_interval: Duration::from_secs(7 * 24 * 3600),
                    age_threshold: Duration::from_secs(90 * 24 * 3600),
                },
            ],
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_recovery_timeout: Duration::from_secs(30),
            ignored_targets: Vec::new(),
            additional_filter_parameters: Vec::new(),
            events_enabled: true,
            events_max_samples_per_name: 10,
            shutdown_timeout: Duration::from_secs(5),
            persistence_batch_size: 500,
            requeue_on_persist_failure: true,
            stack_sampler_interval: Duration::from_millis(5),
            hard_sample_cap: 2000,
        }
    }
}

impl Config {
    /// Slow threshold for a given kind, falling back to the default when no
    /// per-kind override is configured.
    pub fn slow_threshold_for(&self, kind: &str) -> Duration {
        self.slow_threshold_per_kind
            .get(kind)
            .copied()
            .unwrap_or(self.slow_threshold)
    }

    /// Loads overrides from the process environment (optionally reading a
    /// `.env` file first via `dotenvy`), layering them onto `Default`.
    /// Only the handful of operationally-tunable scalars are read this way;
    /// everything else is constructed explicitly by the embedding host.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("APMCORE_ENABLED") {
            cfg.enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Ok(v) = std::env::var("APMCORE_MAX_BUFFER_MEMORY") {
            if let Ok(n) = v.parse() {
                cfg.max_buffer_memory = n;
            }
        }
        if let Ok(v) = std::env::var("APMCORE_FLUSH_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                cfg.flush_interval = Duration::from_secs(n);
            }
        }
        if let Ok(v) = std::env::var("APMCORE_RANDOM_SAMPLE_RATE") {
            if let Ok(n) = v.parse() {
                cfg.random_sample_rate = n;
            }
        }

        cfg
    }
}
