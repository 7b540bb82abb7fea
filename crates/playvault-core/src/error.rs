//! Error types for the PlayVault transfer core

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the transfer core
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Transfer was paused")]
    Paused,

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Rate limited: {status}")]
    RateLimited { status: u16 },

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed early: got {got} of {expected} bytes")]
    ShortRead { expected: u64, got: u64 },

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Extraction failed for {archive}: {message}")]
    Extraction { archive: String, message: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl TransferError {
    /// Transient failures: retried locally up to the chunk's hard ceiling
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Timeout | TransferError::ShortRead { .. } => true,
            TransferError::Network(e) => !e.is_builder() && !e.is_redirect(),
            TransferError::ServerError { status, .. } => *status >= 500 && *status != 503,
            _ => false,
        }
    }

    /// Rate-limit-class failures: retried under the limiter's backoff,
    /// outside the hard retry budget
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            TransferError::RateLimited { .. }
                | TransferError::ServerError { status: 429, .. }
                | TransferError::ServerError { status: 503, .. }
        )
    }

    /// HTTP status carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransferError::RateLimited { status } => Some(*status),
            TransferError::ServerError { status, .. } => Some(*status),
            TransferError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Classify an HTTP response status for a chunk or pool attempt.
    /// 429/503 are rate-limit signals, other 4xx are immediately fatal,
    /// 5xx are transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 | 503 => TransferError::RateLimited { status },
            _ => TransferError::ServerError {
                status,
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(TransferError::from_status(429, "").is_rate_limited());
        assert!(TransferError::from_status(503, "").is_rate_limited());

        let not_found = TransferError::from_status(404, "no such range");
        assert!(!not_found.is_rate_limited());
        assert!(!not_found.is_retryable());

        let bad_gateway = TransferError::from_status(502, "upstream");
        assert!(bad_gateway.is_retryable());

        assert!(TransferError::Timeout.is_retryable());
    }
}
