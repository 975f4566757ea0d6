//! Daemon error types.

use sentinel_domain::DomainError;
use sentinel_exec::ExecError;
use sentinel_store::StoreError;
use thiserror::Error;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A monitor already exists for the key
    #[error("Position already monitored: {0}")]
    AlreadyMonitored(String),

    /// No monitor for the key
    #[error("Monitor not found: {0}")]
    MonitorNotFound(String),

    /// Request rejected before any order was placed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Every breakeven layer failed; the position has no verified stop
    #[error("Critical protection failure for {key}: {detail}")]
    CriticalProtectionFailure { key: String, detail: String },

    /// Event bus error
    #[error("Event bus error: {0}")]
    EventBus(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
