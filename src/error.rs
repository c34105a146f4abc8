//! Error types for the distress engine.
//!
//! Every error here is `Clone` so a single failed computation can be handed to
//! all callers that were coalesced onto it.

use std::time::Duration;

use thiserror::Error;

use crate::models::{FailureKind, SourceOutcomes};

// ---

/// Rejected address input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    // ---
    #[error("unknown borough '{0}'")]
    UnknownBorough(String),

    #[error("house number cannot be empty")]
    EmptyHouseNumber,

    #[error("street name cannot be empty")]
    EmptyStreet,

    #[error("{field} contains characters that are not allowed: '{value}'")]
    IllegalCharacters { field: &'static str, value: String },

    #[error("{field} is longer than {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("invalid borough-block-lot '{0}'")]
    InvalidBbl(String),
}

/// Failure of a single upstream source. Never fatal on its own; the
/// aggregator records it in the per-source outcome map.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    // ---
    /// Network failure, 5xx or throttling. The only retryable kind.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Payload did not have the expected shape.
    #[error("malformed source data: {0}")]
    DataError(String),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("scrape timed out after {0:?}")]
    ScrapeTimeout(Duration),

    #[error("scrape failed: {0}")]
    ScrapeError(String),
}

impl SourceError {
    // ---
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }

    pub fn kind(&self) -> FailureKind {
        // ---
        match self {
            SourceError::Unavailable(_) => FailureKind::Unavailable,
            SourceError::DataError(_) => FailureKind::DataError,
            SourceError::CircuitOpen => FailureKind::CircuitOpen,
            SourceError::ScrapeTimeout(_) => FailureKind::ScrapeTimeout,
            SourceError::ScrapeError(_) => FailureKind::ScrapeError,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        // ---
        if e.is_decode() {
            return SourceError::DataError(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                SourceError::DataError(e.to_string())
            }
            _ => SourceError::Unavailable(e.to_string()),
        }
    }
}

/// Errors surfaced to callers of the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // ---
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("all sources failed: {0}")]
    AllSourcesFailed(SourceOutcomes),

    /// The result cache could not be used. Callers degrade to a direct
    /// aggregation; this never reaches the HTTP layer.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
}

/// Convenience Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        // ---
        assert!(SourceError::Unavailable("503".into()).is_transient());
        assert!(!SourceError::DataError("bad json".into()).is_transient());
        assert!(!SourceError::CircuitOpen.is_transient());
        assert!(!SourceError::ScrapeTimeout(Duration::from_secs(5)).is_transient());
        assert!(!SourceError::ScrapeError("selector".into()).is_transient());
    }

    #[test]
    fn address_error_converts_into_engine_error() {
        // ---
        let err: EngineError = AddressError::EmptyStreet.into();
        assert_eq!(err.to_string(), "invalid address: street name cannot be empty");
    }
}
