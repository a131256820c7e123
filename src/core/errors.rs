//! Error taxonomy and upstream failure classification

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an upstream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Per-minute quota pressure (HTTP 429)
    RateLimited,
    /// Upstream is overloaded or unavailable (HTTP 503)
    ServiceOverloaded,
    /// Transport failed before a response arrived
    NetworkError,
    /// Batch reply did not line up with the unique inputs
    BatchAlignmentError,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Whether the retry engine may try again after this kind of failure
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Unknown)
    }

    /// Whether this failure counts against the circuit breaker
    pub fn charges_breaker(self) -> bool {
        !matches!(self, ErrorKind::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::ServiceOverloaded => "service overloaded",
            ErrorKind::NetworkError => "network error",
            ErrorKind::BatchAlignmentError => "batch alignment error",
            ErrorKind::Unknown => "upstream error",
        };
        f.write_str(name)
    }
}

/// Map a raw upstream failure onto [`ErrorKind`].
///
/// Rules are checked in order; a message that mentions both a quota and an
/// overload is a rate limit.
pub fn classify(status: Option<u16>, message: &str) -> ErrorKind {
    let msg = message.to_lowercase();

    if status == Some(429) || msg.contains("429") || msg.contains("quota") || msg.contains("exhausted")
    {
        ErrorKind::RateLimited
    } else if status == Some(503)
        || msg.contains("503")
        || msg.contains("overloaded")
        || msg.contains("unavailable")
    {
        ErrorKind::ServiceOverloaded
    } else if msg.contains("fetch") || msg.contains("network") {
        ErrorKind::NetworkError
    } else if msg.contains("batch alignment error") {
        ErrorKind::BatchAlignmentError
    } else {
        ErrorKind::Unknown
    }
}

/// Translation-related errors
#[derive(Error, Debug)]
pub enum TranslationError {
    /// The daily token reservoir is empty
    #[error("Daily token reservoir exhausted. Please try again tomorrow")]
    QuotaExhausted,

    /// The circuit breaker is cooling down after repeated failures
    #[error("System is in cooldown due to repeated failures. Please wait a minute")]
    CircuitOpen,

    /// Classified upstream failure
    #[error("{kind}: {message}")]
    Upstream {
        /// Classified kind
        kind: ErrorKind,
        /// HTTP status, when the upstream reported one
        status: Option<u16>,
        /// Raw upstream message
        message: String,
    },

    /// Batch reply line count differs from the unique lines sent
    #[error("Batch alignment error: sent {sent} unique lines, got {received}")]
    BatchAlignment {
        /// Unique lines sent upstream
        sent: usize,
        /// Lines received back
        received: usize,
    },

    /// The operation was aborted by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid response from API
    #[error("Invalid response: {message}")]
    InvalidResponseError {
        /// What was wrong with the response
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// What is misconfigured
        message: String,
    },

    /// Wrapper for anyhow errors
    #[error("Internal error: {0}")]
    InternalError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reqwest error
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl TranslationError {
    /// Build a classified upstream error from a status and message
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        TranslationError::Upstream {
            kind: classify(status, &message),
            status,
            message,
        }
    }

    /// Classification used by the retry engine
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslationError::Upstream { kind, .. } => *kind,
            TranslationError::BatchAlignment { .. } => ErrorKind::BatchAlignmentError,
            TranslationError::HttpError(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    ErrorKind::NetworkError
                } else {
                    classify(e.status().map(|s| s.as_u16()), &e.to_string())
                }
            }
            _ => ErrorKind::Unknown,
        }
    }

    /// True for the rate limit kind
    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }
}

impl From<anyhow::Error> for TranslationError {
    fn from(err: anyhow::Error) -> Self {
        TranslationError::InternalError(err.to_string())
    }
}

/// Result type for translation operations
pub type Result<T> = std::result::Result<T, TranslationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_wins_over_overload() {
        assert_eq!(
            classify(None, "429 Too Many Requests: model overloaded"),
            ErrorKind::RateLimited
        );
        assert_eq!(classify(None, "Resource has been EXHAUSTED"), ErrorKind::RateLimited);
        assert_eq!(classify(Some(503), "quota exceeded"), ErrorKind::RateLimited);
        assert_eq!(classify(Some(429), ""), ErrorKind::RateLimited);
    }

    #[test]
    fn test_overload_rules() {
        assert_eq!(classify(Some(503), "oops"), ErrorKind::ServiceOverloaded);
        assert_eq!(classify(None, "The model is overloaded"), ErrorKind::ServiceOverloaded);
        assert_eq!(classify(None, "503 Service Unavailable"), ErrorKind::ServiceOverloaded);
    }

    #[test]
    fn test_network_and_alignment_rules() {
        assert_eq!(classify(None, "fetch failed"), ErrorKind::NetworkError);
        assert_eq!(classify(None, "Network unreachable"), ErrorKind::NetworkError);
        assert_eq!(
            classify(None, "Batch alignment error: sent 3 unique lines, got 2"),
            ErrorKind::BatchAlignmentError
        );
        assert_eq!(classify(Some(400), "bad request"), ErrorKind::Unknown);
    }

    #[test]
    fn test_error_kind_policy() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::RateLimited.charges_breaker());
        assert!(ErrorKind::BatchAlignmentError.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
        assert!(ErrorKind::Unknown.charges_breaker());
    }

    #[test]
    fn test_translation_error_kind() {
        let err = TranslationError::BatchAlignment { sent: 3, received: 2 };
        assert_eq!(err.kind(), ErrorKind::BatchAlignmentError);
        assert_eq!(classify(None, &err.to_string()), ErrorKind::BatchAlignmentError);

        let err = TranslationError::upstream(Some(503), "busy");
        assert_eq!(err.kind(), ErrorKind::ServiceOverloaded);
        assert_eq!(TranslationError::QuotaExhausted.kind(), ErrorKind::Unknown);
    }
}
