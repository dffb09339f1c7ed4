//! Shared serde deserialisation helpers for exchange wire formats.

use serde::{Deserialize, Deserializer};
use std::{fmt::Display, str::FromStr};

/// Deserialize a `String` as the desired type.
pub fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let data = String::deserialize(deserializer)?;
    data.parse::<T>().map_err(serde::de::Error::custom)
}

/// Deserialize an optional string as an optional f64. Empty or whitespace-only
/// strings map to `None` (OKX sends `""` for absent numeric fields).
pub fn de_opt_str_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize an optional string as an optional i64 epoch-millisecond timestamp.
pub fn de_opt_str_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a field that arrives either as a JSON number or a string-encoded
/// number (Binance sends numeric timestamps, OKX string-encodes everything).
pub fn de_flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(num) => Ok(num),
        NumOrStr::Str(raw) => raw.parse::<i64>().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Record {
        #[serde(deserialize_with = "de_str")]
        price: f64,
        #[serde(deserialize_with = "de_opt_str_f64", default)]
        notional: Option<f64>,
        #[serde(deserialize_with = "de_flexible_i64")]
        ts: i64,
    }

    #[test]
    fn test_de_helpers() {
        struct TestCase {
            input: &'static str,
            expected: Option<Record>,
        }

        let tests = vec![
            // TC0: string-encoded price, empty notional, string ts
            TestCase {
                input: r#"{"price":"100.5","notional":"","ts":"1700000000000"}"#,
                expected: Some(Record {
                    price: 100.5,
                    notional: None,
                    ts: 1700000000000,
                }),
            },
            // TC1: present notional, numeric ts
            TestCase {
                input: r#"{"price":"0.0001","notional":"42.5","ts":1700000000000}"#,
                expected: Some(Record {
                    price: 0.0001,
                    notional: Some(42.5),
                    ts: 1700000000000,
                }),
            },
            // TC2: non-numeric price fails
            TestCase {
                input: r#"{"price":"abc","notional":null,"ts":1}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<Record>(test.input);
            match (actual, test.expected) {
                (Ok(actual), Some(expected)) => assert_eq!(actual, expected, "TC{} failed", index),
                (Err(_), None) => {}
                (actual, expected) => {
                    panic!("TC{index} failed. Actual: {actual:?}, Expected: {expected:?}")
                }
            }
        }
    }
}
