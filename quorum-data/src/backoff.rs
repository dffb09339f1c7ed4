//! Reconnect and REST backoff with deterministic jitter.
//!
//! Jitter derives from an FNV-1a hash of `(seed, attempt)` rather than a
//! random source, so a given seed yields a reproducible schedule.

use crate::time::Ts;
use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::hash::{Hash, Hasher};

/// Deterministic jitter fraction in `[0, max_fraction)`.
pub fn deterministic_jitter(seed: u64, attempt: u32, max_fraction: f64) -> f64 {
    let mut hasher = fnv::FnvHasher::default();
    seed.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let unit = (hasher.finish() % 10_000) as f64 / 10_000.0;
    unit * max_fraction
}

/// WebSocket reconnection policy.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub base_ms: i64,
    pub reconnect_max_ms: i64,
    /// Reset the attempt counter after this long in stable `Open` state.
    pub backoff_reset_ms: i64,
    /// Minimum cooldown when the close code indicates rate-limit policing.
    pub rate_limit_floor_ms: i64,
    pub jitter_seed: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            reconnect_max_ms: 60_000,
            backoff_reset_ms: 120_000,
            rate_limit_floor_ms: 5_000,
            jitter_seed: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(reconnect_max_ms, base * 2^(attempt-1))`, floored at
    /// `rate_limit_floor_ms` when policed, plus ≤20 % deterministic jitter.
    pub fn delay_ms(&self, attempt: u32, rate_limited: bool) -> i64 {
        let exponent = attempt.saturating_sub(1).min(30);
        let raw = self.base_ms.saturating_mul(1i64 << exponent);
        let mut delay = raw.min(self.reconnect_max_ms);
        if rate_limited {
            delay = delay.max(self.rate_limit_floor_ms);
        }
        let jitter = deterministic_jitter(self.jitter_seed, attempt, 0.2);
        delay + (delay as f64 * jitter) as i64
    }
}

/// Per-key REST polling backoff state. `failures` is monotone while failing;
/// the entry is deleted on success.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub failures: u32,
    pub next_allowed_ts: Ts,
}

/// Map of per-symbol (or per-endpoint) REST backoff state.
#[derive(Debug)]
pub struct RestBackoff {
    base_interval_ms: i64,
    jitter_seed: u64,
    states: FnvHashMap<SmolStr, BackoffState>,
}

/// Cap on REST backoff: 300 s.
pub const REST_BACKOFF_CAP_MS: i64 = 300_000;

/// Exponent cap for REST backoff doubling.
pub const REST_BACKOFF_MAX_EXPONENT: u32 = 6;

impl RestBackoff {
    pub fn new(base_interval_ms: i64, jitter_seed: u64) -> Self {
        Self {
            base_interval_ms,
            jitter_seed,
            states: FnvHashMap::default(),
        }
    }

    /// Whether a poll for `key` is allowed at `now`.
    pub fn ready(&self, key: &str, now: Ts) -> bool {
        self.states
            .get(key)
            .is_none_or(|state| now >= state.next_allowed_ts)
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.states.get(key).map_or(0, |state| state.failures)
    }

    /// Record a failed poll: `backoff = min(300 s, base * 2^min(6, failures))`
    /// with ≤10 % deterministic jitter.
    pub fn record_failure(&mut self, key: &str, now: Ts) {
        let state = self.states.entry(SmolStr::from(key)).or_default();
        state.failures = state.failures.saturating_add(1);

        let exponent = state.failures.min(REST_BACKOFF_MAX_EXPONENT);
        let raw = self.base_interval_ms.saturating_mul(1i64 << exponent);
        let backoff = raw.min(REST_BACKOFF_CAP_MS);
        let jitter = deterministic_jitter(self.jitter_seed, state.failures, 0.1);
        state.next_allowed_ts = now + backoff + (backoff as f64 * jitter) as i64;
    }

    /// Success clears the state entirely.
    pub fn record_success(&mut self, key: &str) {
        self.states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_ms: 500,
            reconnect_max_ms: 8_000,
            jitter_seed: 7,
            ..Default::default()
        };

        struct TestCase {
            attempt: u32,
            rate_limited: bool,
            expected_floor: i64,
            expected_ceil: i64,
        }

        let tests = vec![
            // TC0: first attempt = base
            TestCase {
                attempt: 1,
                rate_limited: false,
                expected_floor: 500,
                expected_ceil: 600,
            },
            // TC1: fourth attempt = base * 8
            TestCase {
                attempt: 4,
                rate_limited: false,
                expected_floor: 4_000,
                expected_ceil: 4_800,
            },
            // TC2: capped at reconnect_max_ms
            TestCase {
                attempt: 10,
                rate_limited: false,
                expected_floor: 8_000,
                expected_ceil: 9_600,
            },
            // TC3: rate-limit floors at 5 s
            TestCase {
                attempt: 1,
                rate_limited: true,
                expected_floor: 5_000,
                expected_ceil: 6_000,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let delay = policy.delay_ms(test.attempt, test.rate_limited);
            assert!(
                delay >= test.expected_floor && delay <= test.expected_ceil,
                "TC{} failed: delay {} outside [{}, {}]",
                index,
                delay,
                test.expected_floor,
                test.expected_ceil
            );
        }
    }

    #[test]
    fn test_reconnect_delay_deterministic() {
        let policy = ReconnectPolicy {
            jitter_seed: 42,
            ..Default::default()
        };
        assert_eq!(policy.delay_ms(3, false), policy.delay_ms(3, false));
    }

    #[test]
    fn test_rest_backoff_escalates_and_clears() {
        let mut backoff = RestBackoff::new(10_000, 1);
        assert!(backoff.ready("BTCUSDT", 0));

        backoff.record_failure("BTCUSDT", 0);
        assert_eq!(backoff.failures("BTCUSDT"), 1);
        assert!(!backoff.ready("BTCUSDT", 0));
        // First failure: base * 2^1 = 20 s (+ ≤10 % jitter)
        assert!(backoff.ready("BTCUSDT", 23_000));

        // Escalate to the exponent cap
        for _ in 0..10 {
            backoff.record_failure("BTCUSDT", 0);
        }
        assert_eq!(backoff.failures("BTCUSDT"), 11);
        // min(300 s, 10 s * 2^6) = 300 s cap honoured (+ jitter ≤ 30 s)
        assert!(!backoff.ready("BTCUSDT", 200_000));
        assert!(backoff.ready("BTCUSDT", 331_000));

        backoff.record_success("BTCUSDT");
        assert_eq!(backoff.failures("BTCUSDT"), 0);
        assert!(backoff.ready("BTCUSDT", 0));
    }

    #[test]
    fn test_jitter_bounds() {
        for attempt in 0..100 {
            let jitter = deterministic_jitter(123, attempt, 0.2);
            assert!((0.0..0.2).contains(&jitter), "attempt {attempt}: {jitter}");
        }
    }
}
