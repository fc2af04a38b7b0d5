use thiserror::Error;

use crate::models::{ProxyState, RecordId};

/// Unified error type for the adaptive pool
#[derive(Error, Debug)]
pub enum RotaError {
    // Pool errors
    #[error("Proxy not found: {id}")]
    NotFound { id: RecordId },

    #[error("No eligible proxy available ({active} active in pool)")]
    PoolExhausted { active: usize },

    #[error("Invalid state transition for proxy {id}: {from} -> {to}")]
    InvalidTransition {
        id: RecordId,
        from: ProxyState,
        to: ProxyState,
    },

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, RotaError>;

impl RotaError {
    /// Whether the caller may back off and try again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, RotaError::PoolExhausted { .. })
    }

    /// Errors that indicate a caller bug rather than pool conditions
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            RotaError::NotFound { .. } | RotaError::InvalidTransition { .. }
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotaError {
    fn from(err: url::ParseError) -> Self {
        RotaError::InvalidProxyAddress(err.to_string())
    }
}
