//! Canonical symbol normalisation.
//!
//! A canonical symbol is upper-case alphanumerics with no separators
//! (e.g. `BTCUSDT`). Venue symbols are collapsed by stripping separators and
//! the known derivative suffixes `SWAP`, `FUTURES` and `PERP`.
//!
//! Restriction: canonical symbols must not themselves contain those suffix
//! substrings as a trailing segment; a base asset literally named e.g.
//! `PERP` would collide with the suffix stripping.

use smol_str::SmolStr;

/// Venue-agnostic canonical trading symbol.
pub type Symbol = SmolStr;

/// Derivative suffixes dropped during canonicalisation.
const DERIVATIVE_SUFFIXES: [&str; 3] = ["SWAP", "FUTURES", "PERP"];

/// Collapse a venue symbol to canonical form: upper-case, separators removed,
/// derivative suffixes stripped. OKX inst-ids of the form `BASE-QUOTE[-SWAP]`
/// collapse to `BASEQUOTE`.
pub fn canonical_symbol(venue_symbol: &str) -> Symbol {
    let upper = venue_symbol.to_ascii_uppercase();
    let mut parts: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect();

    while let Some(last) = parts.last() {
        if DERIVATIVE_SUFFIXES.contains(last) {
            parts.pop();
        } else {
            break;
        }
    }

    // Single-token symbols may still carry a glued suffix (e.g. `BTCUSDTPERP`)
    let mut joined = parts.concat();
    for suffix in DERIVATIVE_SUFFIXES {
        if let Some(stripped) = joined.strip_suffix(suffix) {
            if !stripped.is_empty() {
                joined = stripped.to_string();
            }
            break;
        }
    }

    SmolStr::from(joined)
}

/// Map a canonical symbol to the OKX spot inst-id (`BTC-USDT`) given the quote
/// asset convention, or the swap inst-id (`BTC-USDT-SWAP`).
pub fn okx_inst_id(symbol: &str, swap: bool) -> Option<String> {
    let quote = ["USDT", "USDC", "USD", "BTC", "ETH"]
        .into_iter()
        .find(|quote| symbol.ends_with(quote) && symbol.len() > quote.len())?;
    let base = &symbol[..symbol.len() - quote.len()];
    Some(if swap {
        format!("{base}-{quote}-SWAP")
    } else {
        format!("{base}-{quote}")
    })
}
