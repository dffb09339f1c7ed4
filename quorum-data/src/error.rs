use crate::event::Topic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `quorum-data`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http status {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("rate limited: {detail}")]
    RateLimited {
        detail: String,
        retry_after_ms: Option<i64>,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(
        "\
        InvalidSequence: first_update_id {first_update_id} does not follow on from the \
        prev_last_update_id {prev_last_update_id} \
    "
    )]
    InvalidSequence {
        prev_last_update_id: u64,
        first_update_id: u64,
    },

    #[error("subscribe rejected by venue: {0}")]
    SubscribeRejected(String),

    #[error("handler failed on {topic}: {detail}")]
    Handler { topic: Topic, detail: String },

    #[error("journal error: {0}")]
    Journal(String),

    #[error("replay error: {0}")]
    Replay(String),

    #[error("operation aborted by shutdown")]
    Abort,
}

impl DataError {
    /// Determine if an error requires the owning connection to re-initialise.
    pub fn is_terminal(&self) -> bool {
        match self {
            DataError::InvalidSequence { .. } => true,
            DataError::Transport(error_msg) => {
                // Socket termination errors require reconnection. Keyword match is
                // case-insensitive for robustness across tungstenite error formats.
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("terminated")
                    || error_lower.contains("connectionclosed")
                    || error_lower.contains("alreadyclosed")
                    || error_lower.contains("sendafterclosing")
                    || error_lower.contains("io(")
                    // Read timeout indicates silent stream death
                    || error_lower.contains("timeout")
            }
            _ => false,
        }
    }

    /// Rate-limit policing: HTTP 418/429 or an explicit [`DataError::RateLimited`].
    /// Recovery must honour a minimum cooldown floor.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            DataError::RateLimited { .. } => true,
            DataError::Http { status, .. } => matches!(status, 418 | 429),
            _ => false,
        }
    }

    /// Abort-by-shutdown errors are recognised so that cancellation never
    /// bumps failure counters or backoff state.
    pub fn is_abort(&self) -> bool {
        matches!(self, DataError::Abort)
    }
}

impl From<serde_json::Error> for DataError {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_is_terminal() {
        struct TestCase {
            input: DataError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: is terminal w/ DataError::InvalidSequence
                input: DataError::InvalidSequence {
                    prev_last_update_id: 0,
                    first_update_id: 0,
                },
                expected: true,
            },
            TestCase {
                // TC1: is not terminal w/ DataError::Protocol
                input: DataError::Protocol("unexpected field".to_string()),
                expected: false,
            },
            TestCase {
                // TC2: is terminal w/ DataError::Transport containing "Terminated"
                input: DataError::Transport(
                    "ExchangeStream terminated with closing frame".to_string(),
                ),
                expected: true,
            },
            TestCase {
                // TC3: is terminal w/ DataError::Transport containing "ConnectionClosed"
                input: DataError::Transport("WebSocket error: ConnectionClosed".to_string()),
                expected: true,
            },
            TestCase {
                // TC4: is terminal w/ DataError::Transport containing "Io("
                input: DataError::Transport("WebSocket error: Io(Kind(UnexpectedEof))".to_string()),
                expected: true,
            },
            TestCase {
                // TC5: is terminal w/ DataError::Transport containing "timeout"
                input: DataError::Transport(
                    "WebSocket read timeout: no data received for 120 seconds".to_string(),
                ),
                expected: true,
            },
            TestCase {
                // TC6: is not terminal w/ DataError::Abort
                input: DataError::Abort,
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_terminal();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_data_error_is_rate_limit() {
        struct TestCase {
            input: DataError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: explicit RateLimited
                input: DataError::RateLimited {
                    detail: "ws close 1008".to_string(),
                    retry_after_ms: None,
                },
                expected: true,
            },
            TestCase {
                // TC1: HTTP 429
                input: DataError::Http {
                    status: 429,
                    detail: "too many requests".to_string(),
                },
                expected: true,
            },
            TestCase {
                // TC2: HTTP 418 (Binance auto-ban)
                input: DataError::Http {
                    status: 418,
                    detail: "banned".to_string(),
                },
                expected: true,
            },
            TestCase {
                // TC3: HTTP 500 is not a rate limit
                input: DataError::Http {
                    status: 500,
                    detail: "server error".to_string(),
                },
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_rate_limit();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
