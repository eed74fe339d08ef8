//! Common error types for the ingestion services

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the ingestion crates
pub type IngestResult<T> = Result<T, IngestError>;

/// Ingestion error taxonomy
///
/// Each variant maps to one recovery policy. Callers branch on the helper
/// predicates rather than matching every variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// Session token rejected or expired; refresh and reconnect
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Transport dropped or could not be established
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Upstream answered "too many requests"
    #[error("Rate limit rejected (retry after {retry_after:?})")]
    RateLimitRejected {
        /// Server-provided hint, if any
        retry_after: Option<Duration>,
    },

    /// Frame or payload could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Catalog fetch failed for a single category
    #[error("Discovery failed for category {category}: {reason}")]
    DiscoveryPartialFailure {
        /// Category that failed this cycle
        category: String,
        /// Underlying cause
        reason: String,
    },

    /// Persistence boundary is not accepting writes
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// Upstream call exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Non-success upstream response not covered above
    #[error("Upstream error {status}: {message}")]
    Upstream {
        /// HTTP-style status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Invalid configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Whether this is an upstream throttling signal
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitRejected { .. })
    }

    /// Whether the session must be refreshed
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    /// Whether retrying the same call later can succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::MalformedMessage(_) => false,
            Self::Upstream { status, .. } => *status >= 500,
            _ => true,
        }
    }
}
