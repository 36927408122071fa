//! Error types for tether-core.

use thiserror::Error;

/// Result type alias using the tether-core error
pub type Result<T> = std::result::Result<T, SyncError>;

/// Core error types for sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    // Transient network errors (retryable up to the cap)
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    // Malformed or unexpected response, treated as transient
    #[error("Protocol error: {0}")]
    Protocol(String),

    // Non-retryable for the current quota window
    #[error("Daily quota exhausted ({used}/{limit})")]
    QuotaExceeded { used: u32, limit: u32 },

    // Programmer errors, rejected before anything is stored
    #[error("Unknown command type: {0}")]
    UnknownCommandType(String),

    #[error("Unknown update type: {0}")]
    UnknownUpdateType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // Local durability
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Create a not found error
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Whether a later attempt may succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Timeout { .. } | Self::Protocol(_)
        )
    }

    /// Errors raised at the API boundary for bad input; never enqueued.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownCommandType(_) | Self::UnknownUpdateType(_) | Self::InvalidPayload(_)
        )
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout { duration_ms: 0 }
        } else if e.is_decode() {
            SyncError::Protocol(e.to_string())
        } else {
            SyncError::Unreachable(e.to_string())
        }
    }
}
