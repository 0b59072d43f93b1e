//! Early sampling decision and slow-spike promotion (spec §4.3 steps 4-5).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::event::SampleType;

#[derive(Debug, Default)]
struct EndpointState {
    /// Random samples accumulated since process start. Once this reaches
    /// `max_random_samples_per_endpoint` the endpoint leaves its "filling
    /// phase" and switches to probabilistic sampling for good.
    random_samples: u32,
    /// Set by `record_outcome` when a request that was NOT eagerly
    /// instrumented turns out slow or errored. Consumed (and cleared) by
    /// the next `take_force_instrumentation` call for the same endpoint.
    force_instrumentation: bool,
}

/// Per-endpoint sampling counters, shared across all requests hitting the
/// same `(kind, target)`. The collector holds one of these for its entire
/// lifetime — counters are never reset on a cadence, matching spec.md's
/// literal "fewer than N accumulated" wording (not "per window").
#[derive(Default)]
pub struct SamplingRegistry {
    states: Mutex<HashMap<String, EndpointState>>,
}

fn endpoint_key(kind: &str, target: &str) -> String {
    format!("{kind}:{target}")
}

impl SamplingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Early sampling decision (spec §4.3 step 4). `was_instrumented`
    /// reflects whether a `SegmentCollector` was attached to this request
    /// from the start; it does not gate the decision itself, only whether
    /// the resulting context can include segments.
    pub fn decide(
        &self,
        kind: &str,
        target: &str,
        has_error: bool,
        duration: Duration,
        slow_threshold: Duration,
        max_random_samples_per_endpoint: u32,
        random_sample_rate: u32,
    ) -> Option<SampleType> {
        if has_error {
            return Some(SampleType::Error);
        }
        if duration >= slow_threshold {
            return Some(SampleType::Slow);
        }

        let key = endpoint_key(kind, target);
        let mut states = self.states.lock();
        let state = states.entry(key).or_default();

        if state.random_samples < max_random_samples_per_endpoint {
            state.random_samples += 1;
            return Some(SampleType::Random);
        }

        if random_sample_rate <= 1 {
            return Some(SampleType::Random);
        }
        let hit = rand::thread_rng().gen_range(0..random_sample_rate) == 0;
        if hit {
            Some(SampleType::Random)
        } else {
            None
        }
    }

    /// Read-only peek used by `TrackRequest` to decide whether an endpoint
    /// is worth eagerly attaching a `SegmentCollector` to, without
    /// consuming a random-sample slot the way `decide` would. Rolls the
    /// same probability `decide` would for the post-filling-phase case, but
    /// doesn't record the roll anywhere.
    pub fn is_eligible_for_eager_instrumentation(
        &self,
        kind: &str,
        target: &str,
        max_random_samples_per_endpoint: u32,
        random_sample_rate: u32,
    ) -> bool {
        let key = endpoint_key(kind, target);
        let states = self.states.lock();
        let still_filling = states
            .get(&key)
            .map(|s| s.random_samples < max_random_samples_per_endpoint)
            .unwrap_or(true);
        drop(states);
        if still_filling {
            return true;
        }
        if random_sample_rate <= 1 {
            return true;
        }
        rand::thread_rng().gen_range(0..random_sample_rate) == 0
    }

    /// Called after a request completes. If it was slow or errored but
    /// wasn't instrumented up front, arms the one-shot flag so the next
    /// request to this endpoint gets a `SegmentCollector` attached before
    /// its outcome is known (spec §4.3 step 5).
    pub fn record_outcome(&self, kind: &str, target: &str, was_instrumented: bool, is_slow_or_error: bool) {
        if was_instrumented || !is_slow_or_error {
            return;
        }
        let key = endpoint_key(kind, target);
        self.states.lock().entry(key).or_default().force_instrumentation = true;
    }

    /// Consumes the one-shot flag for `(kind, target)`. The host calls this
    /// before starting a request to decide whether to eagerly materialize a
    /// `SegmentCollector`.
    pub fn take_force_instrumentation(&self, kind: &str, target: &str) -> bool {
        let key = endpoint_key(kind, target);
        let mut states = self.states.lock();
        let state = states.entry(key).or_default();
        std::mem::take(&mut state.force_instrumentation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_always_sampled_as_error() {
        let reg = SamplingRegistry::new();
        let decision = reg.decide("http", "T", true, Duration::from_millis(1), Duration::from_secs(1), 5, 100);
        assert_eq!(decision, Some(SampleType::Error));
    }

    #[test]
    fn slow_duration_always_sampled_as_slow() {
        let reg = SamplingRegistry::new();
        let decision = reg.decide("http", "T", false, Duration::from_millis(600), Duration::from_millis(500), 5, 100);
        assert_eq!(decision, Some(SampleType::Slow));
    }

    #[test]
    fn filling_phase_always_samples_until_cap() {
        let reg = SamplingRegistry::new();
        for _ in 0..5 {
            let decision = reg.decide("http", "T", false, Duration::from_millis(1), Duration::from_secs(1), 5, 1_000_000);
            assert_eq!(decision, Some(SampleType::Random));
        }
    }

    #[test]
    fn force_instrumentation_flag_is_one_shot() {
        let reg = SamplingRegistry::new();
        assert!(!reg.take_force_instrumentation("http", "T"));
        reg.record_outcome("http", "T", false, true);
        assert!(reg.take_force_instrumentation("http", "T"));
        assert!(!reg.take_force_instrumentation("http", "T"));
    }

    #[test]
    fn instrumented_outcome_never_arms_flag() {
        let reg = SamplingRegistry::new();
        reg.record_outcome("http", "T", true, true);
        assert!(!reg.take_force_instrumentation("http", "T"));
    }
}
