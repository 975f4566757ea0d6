//! Batched persistence of monitor records.
//!
//! Routine updates are marked dirty and flushed every `flush_interval`.
//! Critical events (creation, removal, fills, breakeven success, phase
//! changes) bypass the buffer with `save_now` / `delete_now`. A write that
//! fails is re-queued and retried by the next flush.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_domain::{MonitorKey, PositionMonitor};
use sentinel_store::{MonitorRepository, StoreError};

use crate::error::DaemonResult;

/// Write-behind buffer in front of a [`MonitorRepository`].
pub struct PersistenceWriter {
    repo: Arc<dyn MonitorRepository>,
    dirty: Mutex<HashMap<MonitorKey, PositionMonitor>>,
    interval: Duration,
}

impl PersistenceWriter {
    pub fn new(repo: Arc<dyn MonitorRepository>, interval: Duration) -> Self {
        Self {
            repo,
            dirty: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// The underlying repository
    pub fn repository(&self) -> Arc<dyn MonitorRepository> {
        Arc::clone(&self.repo)
    }

    /// Queue a record for the next flush. A newer record replaces an older one.
    pub fn mark_dirty(&self, record: &PositionMonitor) {
        self.lock_dirty().insert(record.key(), record.clone());
    }

    /// Write immediately. On failure the record is queued for the next flush.
    pub async fn save_now(&self, record: &PositionMonitor) -> Result<(), StoreError> {
        let key = record.key();
        self.lock_dirty().remove(&key);
        match self.repo.save(&key, record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(key = %key, error = %e, "Immediate save failed, queued for next flush");
                self.lock_dirty().entry(key).or_insert_with(|| record.clone());
                Err(e)
            }
        }
    }

    /// Delete immediately and drop any queued write for the key.
    pub async fn delete_now(&self, key: &MonitorKey) -> Result<(), StoreError> {
        self.lock_dirty().remove(key);
        self.repo.delete(key).await
    }

    /// Write every queued record. Returns how many were written.
    pub async fn flush(&self) -> usize {
        let batch: Vec<(MonitorKey, PositionMonitor)> = self.lock_dirty().drain().collect();
        if batch.is_empty() {
            return 0;
        }

        let mut written = 0;
        for (key, record) in batch {
            match self.repo.save(&key, &record).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Flush failed for record (will retry)");
                    // A newer record queued meanwhile wins
                    self.lock_dirty().entry(key).or_insert(record);
                }
            }
        }
        debug!(written, "Persistence flush");
        written
    }

    /// Records waiting for the next flush
    pub fn pending_count(&self) -> usize {
        self.lock_dirty().len()
    }

    /// Run the periodic flush until `shutdown`, then flush one last time.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<DaemonResult<()>> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Persistence writer started");

            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // First tick is immediate

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush().await;
                    }
                }
            }

            let written = self.flush().await;
            info!(written, pending = self.pending_count(), "Persistence writer stopped");
            Ok(())
        })
    }

    fn lock_dirty(&self) -> std::sync::MutexGuard<'_, HashMap<MonitorKey, PositionMonitor>> {
        self.dirty.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Tests
// =============================================================================
