//! Storage layer errors

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity not found
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        /// Type of entity
        entity_type: String,
        /// Entity ID
        id: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error (reading a persisted record)
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Backend unavailable or failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Domain error passthrough
    #[error("Domain error: {0}")]
    Domain(#[from] sentinel_domain::DomainError),
}

impl StoreError {
    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            StoreError::Deserialization(err.to_string())
        } else {
            StoreError::Serialization(err.to_string())
        }
    }
}
