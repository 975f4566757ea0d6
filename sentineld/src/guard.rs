//! Per-position locks and the global creation lock.
//!
//! Each position has three independent locks so unrelated work on the same
//! position does not serialize: breakeven (the protection cascade), rebalance
//! (TP ladder and stop resizing) and phase (lifecycle transitions). The
//! creation lock is global and serializes first registration of any monitor.
//!
//! Locks are never taken across positions. When the mirror coordinator runs
//! it takes the mirror position's locks only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

use sentinel_domain::MonitorKey;

/// The three concern locks of one position.
#[derive(Debug, Default)]
pub struct PositionLocks {
    breakeven: Arc<Mutex<()>>,
    rebalance: Arc<Mutex<()>>,
    phase: Arc<Mutex<()>>,
}

/// Lock registry keyed by monitor.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    positions: StdMutex<HashMap<MonitorKey, Arc<PositionLocks>>>,
    creation: Mutex<()>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self, key: &MonitorKey) -> Arc<PositionLocks> {
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(positions.entry(key.clone()).or_default())
    }

    /// Serialize breakeven work on `key`
    pub async fn lock_breakeven(&self, key: &MonitorKey) -> OwnedMutexGuard<()> {
        Arc::clone(&self.locks(key).breakeven).lock_owned().await
    }

    /// Take the breakeven lock only if nobody holds it
    pub fn try_breakeven(&self, key: &MonitorKey) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.locks(key).breakeven).try_lock_owned().ok()
    }

    /// Whether a breakeven cascade is running on `key`
    pub fn breakeven_in_flight(&self, key: &MonitorKey) -> bool {
        self.locks(key).breakeven.try_lock().is_err()
    }

    /// Serialize ladder and stop resizing on `key`
    pub async fn lock_rebalance(&self, key: &MonitorKey) -> OwnedMutexGuard<()> {
        Arc::clone(&self.locks(key).rebalance).lock_owned().await
    }

    /// Serialize phase transitions on `key`
    pub async fn lock_phase(&self, key: &MonitorKey) -> OwnedMutexGuard<()> {
        Arc::clone(&self.locks(key).phase).lock_owned().await
    }

    /// Serialize monitor creation across all positions
    pub async fn lock_creation(&self) -> MutexGuard<'_, ()> {
        self.creation.lock().await
    }

    /// Drop the locks of a removed monitor. Holders keep their guards.
    pub fn forget(&self, key: &MonitorKey) {
        self.positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Number of positions with lock state
    pub fn tracked(&self) -> usize {
        self.positions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
