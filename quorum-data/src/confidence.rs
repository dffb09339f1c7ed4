//! Versioned confidence scoring and source trust rules.
//!
//! `compute_confidence_score` is a pure function: identical inputs produce an
//! identical score and an identical ordered penalty trace, independent of
//! struct field or input list ordering.

use crate::event::StreamId;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Formula version stamped on every score.
pub const CONFIDENCE_VERSION: &str = "v1";

/// Immutable inputs to the confidence formula.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceInputs {
    pub fresh_sources_count: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expected_sources: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stale_sources_dropped_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mismatch_detected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gap_detected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence_broken: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lag_detected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outlier_detected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fallback_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_cap: Option<f64>,
}

/// One applied penalty factor, in application order.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyTrace {
    pub reason: SmolStr,
    pub factor: f64,
}

/// Result of the confidence formula.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceScore {
    pub score: f64,
    pub version: SmolStr,
    pub penalties: Vec<PenaltyTrace>,
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Compute the `v1` confidence score.
///
/// `base = clamp01(fresh/expected)` when `expected > 0`, else
/// `clamp01(fresh/(fresh+stale))` when that denominator is positive, else 0.
/// Multiplicative penalties apply in a fixed order; `source_cap` clamps last.
pub fn compute_confidence_score(inputs: &ConfidenceInputs) -> ConfidenceScore {
    let fresh = inputs.fresh_sources_count as f64;
    let stale = inputs.stale_sources_dropped_count.unwrap_or(0) as f64;

    let base = match inputs.expected_sources {
        Some(expected) if expected > 0 => clamp01(fresh / expected as f64),
        _ if fresh + stale > 0.0 => clamp01(fresh / (fresh + stale)),
        _ => 0.0,
    };

    let mut score = base;
    let mut penalties = Vec::new();
    let mut apply = |reason: &str, factor: f64, score: &mut f64| {
        *score *= factor;
        penalties.push(PenaltyTrace {
            reason: SmolStr::from(reason),
            factor,
        });
    };

    if inputs.mismatch_detected == Some(true) {
        apply("mismatch", 0.5, &mut score);
    }
    if inputs.gap_detected == Some(true) {
        apply("gap", 0.7, &mut score);
    }
    if inputs.sequence_broken == Some(true) {
        apply("sequence_broken", 0.5, &mut score);
    }
    if inputs.lag_detected == Some(true) {
        apply("lag", 0.8, &mut score);
    }
    if inputs.outlier_detected == Some(true) {
        apply("outlier", 0.8, &mut score);
    }
    if let Some(fallback) = inputs.fallback_penalty {
        apply("fallback", clamp01(fallback), &mut score);
    }
    if let Some(source) = inputs.source_penalty {
        apply("source", clamp01(source), &mut score);
    }
    if let Some(cap) = inputs.source_cap {
        score = score.min(clamp01(cap));
    }

    ConfidenceScore {
        score: clamp01(score),
        version: SmolStr::from(CONFIDENCE_VERSION),
        penalties,
    }
}

// ------------------------------------------------------------------------
// Source trust rules
// ------------------------------------------------------------------------

/// Context a trust rule applies to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustContext {
    Liquidation,
    Trade,
}

/// Venue-specific trust adjustment matched by stream-id pattern
/// (case-insensitive substring).
#[derive(Clone, Debug)]
pub struct TrustRule {
    pub context: TrustContext,
    pub pattern: &'static str,
    pub penalty: Option<f64>,
    pub cap: Option<f64>,
    pub reason: &'static str,
}

/// Built-in trust table. Bybit reports liquidations at bankruptcy price, OKX
/// throttles its liquidation feed to a subset of orders.
pub const TRUST_RULES: [TrustRule; 2] = [
    TrustRule {
        context: TrustContext::Liquidation,
        pattern: "bybit",
        penalty: Some(0.9),
        cap: Some(0.7),
        reason: "BYBIT_BANKRUPTCY_PRICE",
    },
    TrustRule {
        context: TrustContext::Liquidation,
        pattern: "okx",
        penalty: None,
        cap: None,
        reason: "OKX_LIQUIDATIONS_LIMITED",
    },
];

/// Composite trust adjustment for a set of contributing sources.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustAdjustments {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_cap: Option<f64>,
    pub reasons: Vec<SmolStr>,
}

/// Match the trust table against the contributing stream ids. Each rule fires
/// at most once; matches compose by multiplication (penalty) and minimum
/// (cap). `reasons` is emitted sorted ascending, so the output is invariant
/// under input list order.
pub fn source_trust_adjustments(
    context: TrustContext,
    stream_ids: &[StreamId],
) -> TrustAdjustments {
    let mut penalty: Option<f64> = None;
    let mut cap: Option<f64> = None;
    let mut reasons = Vec::new();

    for rule in TRUST_RULES.iter().filter(|rule| rule.context == context) {
        let matched = stream_ids
            .iter()
            .any(|id| id.to_ascii_lowercase().contains(rule.pattern));
        if !matched {
            continue;
        }

        if let Some(rule_penalty) = rule.penalty {
            penalty = Some(penalty.unwrap_or(1.0) * rule_penalty);
        }
        if let Some(rule_cap) = rule.cap {
            cap = Some(cap.map_or(rule_cap, |current| current.min(rule_cap)));
        }
        reasons.push(SmolStr::from(rule.reason));
    }

    reasons.sort();
    TrustAdjustments {
        source_penalty: penalty,
        source_cap: cap,
        reasons,
    }
}
