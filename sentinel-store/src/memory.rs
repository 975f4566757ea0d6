//! In-memory store implementation
//!
//! Used for testing and development without a backing file or database.
//! Records are kept as serialized JSON so every save and load exercises the
//! persisted schema. Thread-safe using RwLock for concurrent access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::warn;

use sentinel_domain::{MonitorKey, PositionMonitor};

use crate::error::StoreError;
use crate::repository::MonitorRepository;

/// In-memory store for testing
pub struct MemoryStore {
    records: RwLock<HashMap<String, String>>,
    saves: AtomicU64,
    deletes: AtomicU64,
    fail_next: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            saves: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Get the number of stored records
    pub fn record_count(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether a record exists for `key`
    pub fn contains(&self, key: &MonitorKey) -> bool {
        self.records
            .read()
            .map(|r| r.contains_key(&key.to_string()))
            .unwrap_or(false)
    }

    /// Successful saves so far
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Successful deletes so far
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make the next write fail with a backend error
    pub fn set_fail_next(&self, fail: bool) {
        self.fail_next.store(fail, Ordering::SeqCst);
    }

    /// Store raw JSON under a key (for exercising schema compatibility)
    pub fn insert_raw(&self, key: &str, json: &str) {
        if let Ok(mut records) = self.records.write() {
            records.insert(key.to_string(), json.to_string());
        }
    }

    /// Clear all data (useful for test setup)
    pub fn clear(&self) {
        if let Ok(mut records) = self.records.write() {
            records.clear();
        }
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("Simulated store failure".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MonitorRepository for MemoryStore {
    async fn load_all(&self) -> Result<HashMap<MonitorKey, PositionMonitor>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Backend(format!("Lock poisoned: {e}")))?;

        let mut out = HashMap::with_capacity(records.len());
        for (key, json) in records.iter() {
            let parsed_key: MonitorKey = match key.parse() {
                Ok(k) => k,
                Err(e) => {
                    warn!(%key, error = %e, "Skipping record with malformed key");
                    continue;
                }
            };
            match serde_json::from_str::<PositionMonitor>(json) {
                Ok(record) => {
                    out.insert(parsed_key, record);
                }
                Err(e) => {
                    warn!(%key, error = %e, "Skipping unreadable record");
                }
            }
        }
        Ok(out)
    }

    async fn save(&self, key: &MonitorKey, record: &PositionMonitor) -> Result<(), StoreError> {
        self.check_failure()?;
        let json = serde_json::to_string(record)?;
        self.records
            .write()
            .map_err(|e| StoreError::Backend(format!("Lock poisoned: {e}")))?
            .insert(key.to_string(), json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &MonitorKey) -> Result<(), StoreError> {
        self.check_failure()?;
        self.records
            .write()
            .map_err(|e| StoreError::Backend(format!("Lock poisoned: {e}")))?
            .remove(&key.to_string());
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sentinel_domain::{Account, Phase, Price, Quantity, Side, Symbol};

    fn key(account: Account) -> MonitorKey {
        MonitorKey::new(Symbol::from_pair("BTCUSDT").unwrap(), Side::Long, account)
    }

    fn record(k: &MonitorKey) -> PositionMonitor {
        PositionMonitor::new(k, Price::new(dec!(100)).unwrap(), Quantity::new(dec!(1)).unwrap(), "ops")
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemoryStore::new();
        let main = key(Account::Primary);
        let mirror = key(Account::Mirror);

        store.save(&main, &record(&main)).await.unwrap();
        store.save(&mirror, &record(&mirror)).await.unwrap();
        assert_eq!(store.record_count(), 2);

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded[&main].phase, Phase::Building);
        assert_eq!(loaded[&mirror].account, Account::Mirror);

        store.delete(&main).await.unwrap();
        store.delete(&main).await.unwrap();
        assert!(!store.contains(&main));
        assert_eq!(store.delete_count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_records_are_skipped() {
        let store = MemoryStore::new();
        let main = key(Account::Primary);
        store.save(&main, &record(&main)).await.unwrap();
        store.insert_raw("ETHUSDT:long:main", "{not json");
        store.insert_raw("garbage", "{}");

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&main));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        let main = key(Account::Primary);
        store.set_fail_next(true);

        assert!(matches!(store.save(&main, &record(&main)).await, Err(StoreError::Backend(_))));
        assert!(store.save(&main, &record(&main)).await.is_ok());
        assert_eq!(store.save_count(), 1);
    }
}
