//! Error taxonomy for the analysis pipeline

use crate::types::Symbol;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`FeedAdapter`](crate::feed::FeedAdapter).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    #[error("quote feed unavailable for {symbol}: {reason}")]
    Unavailable { symbol: Symbol, reason: String },

    #[error("quote feed rate limited {symbol}")]
    RateLimited {
        symbol: Symbol,
        retry_after: Option<Duration>,
    },

    #[error("quote feed timed out for {symbol} after {timeout:?}")]
    Timeout { symbol: Symbol, timeout: Duration },

    #[error("quote feed does not know symbol {0}")]
    InvalidSymbol(Symbol),
}

impl FeedError {
    /// Transient errors are retried with backoff; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FeedError::InvalidSymbol(_))
    }
}

/// Errors from a [`CacheStore`](crate::cache::CacheStore).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode or decode cached value: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Detector-level conditions. Never surfaced past the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("insufficient history: need {needed} candles, have {available}")]
    InsufficientHistory { needed: usize, available: usize },

    #[error("no candles fetched for {0}")]
    MissingSymbol(Symbol),
}

/// Rejected configuration or settings update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigurationError {
    pub(crate) fn check_range(
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    ) -> Result<(), ConfigurationError> {
        if value.is_finite() && value >= min && value <= max {
            Ok(())
        } else {
            Err(ConfigurationError::OutOfRange {
                field,
                min,
                max,
                value,
            })
        }
    }
}
