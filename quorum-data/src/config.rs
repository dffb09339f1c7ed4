//! Runtime configuration from environment variables.
//!
//! Policy tables are pure data with compile-time defaults; the environment
//! only overrides them at startup, after which every config struct is
//! frozen.

use crate::aggregate::cvd::CvdMismatchPolicy;
use std::path::PathBuf;

/// Environment-derived settings.
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// `BOT_JOURNAL_DIR`
    pub journal_dir: PathBuf,
    /// `BOT_CVD_DEBUG`
    pub cvd_debug: bool,
    /// `OKX_ENABLE_KLINES`
    pub okx_enable_klines: bool,
    /// `OKX_RESYNC_MIN_GAP_COUNT`
    pub okx_resync_min_gap_count: u32,
    /// `OKX_RESYNC_PENDING_MAX_MS`
    pub okx_resync_pending_max_ms: i64,
    /// `BOT_CVD_MISMATCH_*`
    pub cvd_mismatch: CvdMismatchPolicy,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            journal_dir: PathBuf::from("journal"),
            cvd_debug: false,
            okx_enable_klines: false,
            okx_resync_min_gap_count: 1,
            okx_resync_pending_max_ms: 5_000,
            cvd_mismatch: CvdMismatchPolicy::default(),
        }
    }
}

impl EnvConfig {
    /// Read from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read from an arbitrary lookup (tests supply a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("BOT_JOURNAL_DIR") {
            if !dir.trim().is_empty() {
                config.journal_dir = PathBuf::from(dir);
            }
        }
        config.cvd_debug = flag(&lookup, "BOT_CVD_DEBUG", config.cvd_debug);
        config.okx_enable_klines = flag(&lookup, "OKX_ENABLE_KLINES", config.okx_enable_klines);
        config.okx_resync_min_gap_count = parsed(
            &lookup,
            "OKX_RESYNC_MIN_GAP_COUNT",
            config.okx_resync_min_gap_count,
        )
        .max(1);
        config.okx_resync_pending_max_ms = parsed(
            &lookup,
            "OKX_RESYNC_PENDING_MAX_MS",
            config.okx_resync_pending_max_ms,
        );

        let mismatch = &mut config.cvd_mismatch;
        mismatch.ewma_alpha = parsed(&lookup, "BOT_CVD_MISMATCH_EWMA_ALPHA", mismatch.ewma_alpha);
        mismatch.min_ewma_abs =
            parsed(&lookup, "BOT_CVD_MISMATCH_MIN_EWMA_ABS", mismatch.min_ewma_abs);
        mismatch.min_abs_scaled = parsed(
            &lookup,
            "BOT_CVD_MISMATCH_MIN_ABS_SCALED",
            mismatch.min_abs_scaled,
        );
        mismatch.min_scale = parsed(&lookup, "BOT_CVD_MISMATCH_MIN_SCALE", mismatch.min_scale);
        mismatch.max_scale = parsed(&lookup, "BOT_CVD_MISMATCH_MAX_SCALE", mismatch.max_scale);
        mismatch.sign_agreement_threshold = parsed(
            &lookup,
            "BOT_CVD_MISMATCH_SIGN_AGREEMENT_THRESHOLD",
            mismatch.sign_agreement_threshold,
        );
        mismatch.z_thresh = parsed(&lookup, "BOT_CVD_MISMATCH_Z_THRESH", mismatch.z_thresh);
        mismatch.z_max = parsed(&lookup, "BOT_CVD_MISMATCH_Z_MAX", mismatch.z_max);
        mismatch.ratio_thresh =
            parsed(&lookup, "BOT_CVD_MISMATCH_RATIO_THRESH", mismatch.ratio_thresh);
        mismatch.ratio_max = parsed(&lookup, "BOT_CVD_MISMATCH_RATIO_MAX", mismatch.ratio_max);
        mismatch.penalty_sign =
            parsed(&lookup, "BOT_CVD_MISMATCH_PENALTY_SIGN", mismatch.penalty_sign);
        mismatch.penalty_dispersion = parsed(
            &lookup,
            "BOT_CVD_MISMATCH_PENALTY_DISPERSION",
            mismatch.penalty_dispersion,
        );

        config
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(raw) => matches!(raw.trim(), "1" | "true" | "TRUE" | "yes" | "on"),
        None => default,
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}
