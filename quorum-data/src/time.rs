//! Time sources and fixed-width bucket math.
//!
//! All internal time access goes through the injectable [`Clock`] trait so
//! deterministic tests can drive a [`VirtualClock`] instead of wall time.

use chrono::Utc;
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

/// Epoch-millisecond timestamp used throughout the pipeline.
pub type Ts = i64;

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ts;
}

/// Production clock reading wall time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ts {
        Utc::now().timestamp_millis()
    }
}

/// Deterministic clock for tests, advanced explicitly.
#[derive(Debug, Default)]
pub struct VirtualClock(AtomicI64);

impl VirtualClock {
    pub fn new(start_ms: Ts) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    pub fn set(&self, now_ms: Ts) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: Ts) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> Ts {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared handle for a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Inclusive start of the fixed-width bucket containing `ts`.
pub fn bucket_start(ts: Ts, bucket_ms: i64) -> Ts {
    debug_assert!(bucket_ms > 0);
    ts.div_euclid(bucket_ms) * bucket_ms
}

/// Exclusive close of the fixed-width bucket containing `ts`.
pub fn bucket_close(ts: Ts, bucket_ms: i64) -> Ts {
    bucket_start(ts, bucket_ms) + bucket_ms
}

/// Parse a kline interval string ("1m", "5m", "1h", "4h", "1d") into millis.
pub fn interval_duration_ms(interval: &str) -> Option<i64> {
    let (digits, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let n: i64 = digits.parse().ok()?;
    if n <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" | "D" => 86_400_000,
        "w" | "W" => 7 * 86_400_000,
        _ => return None,
    };
    Some(n * unit_ms)
}
