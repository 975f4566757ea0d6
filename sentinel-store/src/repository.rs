//! Repository trait definitions (Ports)
//!
//! The storage interface for monitor records.
//! Implementations can be file-backed, database-backed, or in-memory for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use sentinel_domain::{MonitorKey, PositionMonitor};

use crate::error::StoreError;

/// Repository for monitor records, keyed by `SYMBOL:side:account`
#[async_trait]
pub trait MonitorRepository: Send + Sync {
    /// Load every persisted record
    async fn load_all(&self) -> Result<HashMap<MonitorKey, PositionMonitor>, StoreError>;

    /// Save a record (insert or update)
    async fn save(&self, key: &MonitorKey, record: &PositionMonitor) -> Result<(), StoreError>;

    /// Delete a record. Deleting a missing key is not an error.
    async fn delete(&self, key: &MonitorKey) -> Result<(), StoreError>;
}
