//! Execution layer error types.

use thiserror::Error;

/// Errors that can occur during exchange operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Exchange communication error
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Order was rejected by exchange
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Order is not (or no longer) known to the exchange
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Request was throttled
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] sentinel_domain::DomainError),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// Timeouts and rate limits clear up on their own and are worth retrying.
    /// Everything else is a definite answer from the exchange (or from us).
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Timeout(_) | ExecError::RateLimited(_))
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
