//! Monitor registry.
//!
//! Owns every live [`MonitorEntry`] (the record plus its watcher task) keyed
//! by `(symbol, side, account)`. There is exactly one entry per key: first
//! registration runs under the global creation lock, so a position found by
//! startup reconciliation and by a live open at the same time still yields
//! one monitor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};

use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sentinel_domain::{
    EntryLeg, EntryLegStatus, MonitorKey, PositionMonitor, Price, Quantity, SlOrder, TpOrder, TpStatus,
};
use sentinel_exec::{place_with_retry, OrderRequest};

use crate::alerts::AlertTemplate;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::DaemonEvent;
use crate::rebalancer::ladder_quantities;
use crate::services::Services;
use crate::watcher::PositionWatcher;

// =============================================================================
// Entry
// =============================================================================

/// One monitored position: its record and the handle of its watcher.
///
/// The record sits behind a std lock that is never held across an await;
/// components read a clone with [`snapshot`](Self::snapshot) and write
/// through [`update`](Self::update).
#[derive(Debug)]
pub struct MonitorEntry {
    pub key: MonitorKey,
    record: StdRwLock<PositionMonitor>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorEntry {
    pub fn new(record: PositionMonitor, cancel: CancellationToken) -> Self {
        Self {
            key: record.key(),
            record: StdRwLock::new(record),
            cancel,
            task: Mutex::new(None),
        }
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> PositionMonitor {
        self.record.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mutate the record in place
    pub fn update<R>(&self, f: impl FnOnce(&mut PositionMonitor) -> R) -> R {
        let mut record = self.record.write().unwrap_or_else(|e| e.into_inner());
        f(&mut record)
    }

    /// Token that stops this entry's watcher
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the watcher to stop after its current tick
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

// =============================================================================
// Open request
// =============================================================================

/// A freshly opened position to protect.
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    pub key: MonitorKey,
    /// Average price of what is already filled
    pub entry_price: Price,
    pub filled_size: Quantity,
    /// Entry limit legs still to rest, as (price, quantity)
    pub entry_legs: Vec<(Price, Quantity)>,
    pub stop_price: Price,
    /// One price per ladder rung, TP1 first
    pub tp_prices: Vec<Price>,
    /// Overrides the configured alert target
    pub alert_target: Option<String>,
}

// =============================================================================
// Registry
// =============================================================================

pub struct MonitorRegistry {
    services: Arc<Services>,
    entries: RwLock<HashMap<MonitorKey, Arc<MonitorEntry>>>,
    shutdown: CancellationToken,
}

impl MonitorRegistry {
    pub fn new(services: Arc<Services>, shutdown: CancellationToken) -> Self {
        Self {
            services,
            entries: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Daemon-wide shutdown token; watcher tokens are children of it
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub async fn get(&self, key: &MonitorKey) -> Option<Arc<MonitorEntry>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &MonitorKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<MonitorKey> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Add a record without starting its watcher.
    ///
    /// # Errors
    /// `DaemonError::AlreadyMonitored` if the key is taken.
    pub async fn insert(&self, record: PositionMonitor) -> DaemonResult<Arc<MonitorEntry>> {
        let _creation = self.services.guard.lock_creation().await;
        self.insert_locked(record).await
    }

    /// Add a record and start its watcher.
    pub async fn register(self: &Arc<Self>, record: PositionMonitor) -> DaemonResult<Arc<MonitorEntry>> {
        let entry = self.insert(record).await?;
        self.spawn_watcher(&entry);
        Ok(entry)
    }

    /// Caller holds the creation lock
    async fn insert_locked(&self, record: PositionMonitor) -> DaemonResult<Arc<MonitorEntry>> {
        let key = record.key();
        if self.contains(&key).await {
            return Err(DaemonError::AlreadyMonitored(key.to_string()));
        }

        if let Err(e) = self.services.persistence.save_now(&record).await {
            warn!(%key, error = %e, "New monitor not persisted yet");
        }

        let phase = record.phase;
        let entry = Arc::new(MonitorEntry::new(record, self.shutdown.child_token()));
        self.entries.write().await.insert(key.clone(), Arc::clone(&entry));

        info!(%key, %phase, "Monitor registered");
        self.services.bus.send(DaemonEvent::MonitorCreated { key, phase });
        Ok(entry)
    }

    /// Start the watcher task of `entry`
    pub fn spawn_watcher(self: &Arc<Self>, entry: &Arc<MonitorEntry>) {
        let watcher = PositionWatcher::new(Arc::clone(self), Arc::clone(entry));
        entry.set_task(tokio::spawn(watcher.run()));
    }

    /// Protect a freshly opened position.
    ///
    /// Places the stop for the full exposure (filled size plus entry legs),
    /// then the entry legs, registers the monitor and places the TP ladder
    /// for the filled size. Nothing is registered if the stop cannot be
    /// placed.
    ///
    /// # Errors
    /// `InvalidRequest` for a malformed request, `AlreadyMonitored` if the
    /// key is taken, `Exec` if the stop placement fails.
    pub async fn open_position(self: &Arc<Self>, request: OpenPositionRequest) -> DaemonResult<Arc<MonitorEntry>> {
        let services = &self.services;
        let key = request.key.clone();
        self.validate(&request)?;

        let creation = services.guard.lock_creation().await;
        if self.contains(&key).await {
            return Err(DaemonError::AlreadyMonitored(key.to_string()));
        }

        let exchange = services.router.for_account(key.account)?;
        let retry = services.config.retry;
        let rules = services.config.instruments.rules_for(&key.symbol);

        let leg_total: Quantity = request.entry_legs.iter().map(|(_, q)| *q).sum();
        let exposure = request.filled_size + leg_total;
        let stop_request = OrderRequest::stop_loss(&key.symbol, key.side, request.stop_price, exposure);
        let sl_id = place_with_retry(exchange.as_ref(), &retry, &stop_request).await?;
        info!(%key, order_id = %sl_id, price = %request.stop_price, quantity = %exposure, "Initial stop placed");

        let mut legs = Vec::new();
        for (price, quantity) in &request.entry_legs {
            let leg_request = OrderRequest::entry_limit(&key.symbol, key.side, *price, *quantity);
            match place_with_retry(exchange.as_ref(), &retry, &leg_request).await {
                Ok(order_id) => legs.push(EntryLeg {
                    order_id,
                    price: *price,
                    quantity: *quantity,
                    status: EntryLegStatus::Open,
                }),
                Err(e) => warn!(%key, %price, %quantity, error = %e, "Entry leg not placed, skipping"),
            }
        }

        let target = request
            .alert_target
            .clone()
            .unwrap_or_else(|| services.config.alert_target.clone());
        let percentages = services.config.ladder.percentages();
        let quantities = ladder_quantities(request.filled_size, percentages, &rules);

        let mut record = PositionMonitor::new(&key, request.entry_price, request.filled_size, target)
            .with_stop(SlOrder {
                order_id: sl_id,
                trigger_price: request.stop_price,
                quantity: exposure,
                covers_full_position: true,
                live: true,
            })
            .with_entry_legs(legs);
        record.tp_orders = request
            .tp_prices
            .iter()
            .zip(percentages.iter().zip(quantities))
            .enumerate()
            .map(|(i, (price, (pct, quantity)))| TpOrder {
                order_id: None,
                tp_number: u8::try_from(i + 1).unwrap_or(u8::MAX),
                price: *price,
                quantity,
                percentage: *pct,
                status: TpStatus::Unplaced,
                filled_at: None,
            })
            .collect();

        let entry = self.insert_locked(record).await?;
        drop(creation);

        let report = services.rebalancer.rebalance(&entry).await?;
        if report.failed > 0 {
            warn!(%key, failed = report.failed, "Some TP orders not placed, watcher will retry");
        }
        let record = entry.snapshot();
        if let Err(e) = services.persistence.save_now(&record).await {
            warn!(%key, error = %e, "Opened monitor not persisted yet");
        }

        services.alerts.dispatch(
            &record.alert_target,
            AlertTemplate::MonitorOpened,
            json!({
                "key": key.to_string(),
                "entry_price": record.entry_price.to_string(),
                "size": record.remaining_size.to_string(),
                "stop": request.stop_price.to_string(),
                "take_profits": record.open_tps().count(),
            }),
        );

        self.spawn_watcher(&entry);
        Ok(entry)
    }

    fn validate(&self, request: &OpenPositionRequest) -> DaemonResult<()> {
        let side = request.key.side;
        let ladder = &self.services.config.ladder;
        if request.filled_size.is_zero() {
            return Err(DaemonError::InvalidRequest("filled size must be positive".into()));
        }
        if request.tp_prices.len() != ladder.len() {
            return Err(DaemonError::InvalidRequest(format!(
                "expected {} take-profit prices, got {}",
                ladder.len(),
                request.tp_prices.len()
            )));
        }
        if ladder.percentages().iter().sum::<Decimal>() != Decimal::ONE_HUNDRED {
            return Err(DaemonError::InvalidRequest("ladder does not sum to 100".into()));
        }
        if !side.improves_stop(request.entry_price, request.stop_price) {
            return Err(DaemonError::InvalidRequest(format!(
                "stop {} is not on the losing side of entry {}",
                request.stop_price, request.entry_price
            )));
        }
        if let Some(tp) = request.tp_prices.iter().find(|tp| !side.improves_stop(**tp, request.entry_price)) {
            return Err(DaemonError::InvalidRequest(format!(
                "take-profit {tp} is not on the winning side of entry {}",
                request.entry_price
            )));
        }
        Ok(())
    }

    /// Stop watching `key`. The watcher cancels the orders it still owns and
    /// removes the entry.
    ///
    /// # Errors
    /// `DaemonError::MonitorNotFound` if no monitor exists for `key`.
    pub async fn stop_monitoring(&self, key: &MonitorKey) -> DaemonResult<()> {
        let entry = self
            .get(key)
            .await
            .ok_or_else(|| DaemonError::MonitorNotFound(key.to_string()))?;
        info!(%key, "Stopping monitor");
        entry.stop();
        Ok(())
    }

    /// Drop `key` from the registry and delete its record.
    pub async fn remove(&self, key: &MonitorKey, reason: &str) -> Option<Arc<MonitorEntry>> {
        let entry = self.entries.write().await.remove(key)?;
        self.services.guard.forget(key);
        if let Err(e) = self.services.persistence.delete_now(key).await {
            warn!(%key, error = %e, "Failed to delete monitor record");
        }
        info!(%key, reason, "Monitor removed");
        self.services.bus.send(DaemonEvent::MonitorRemoved {
            key: key.clone(),
            reason: reason.to_string(),
        });
        Some(entry)
    }

    /// Register every persisted monitor and start its watcher.
    ///
    /// Closed records left over from a crash are deleted instead.
    pub async fn restore_from_store(self: &Arc<Self>) -> DaemonResult<usize> {
        let records = self.services.persistence.repository().load_all().await?;
        let mut restored = 0;
        for (key, record) in records {
            if record.is_closed() {
                info!(%key, "Discarding closed monitor record");
                if let Err(e) = self.services.persistence.delete_now(&key).await {
                    warn!(%key, error = %e, "Failed to delete closed record");
                }
                continue;
            }
            match self.register(record).await {
                Ok(_) => restored += 1,
                Err(DaemonError::AlreadyMonitored(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(restored, "Monitors restored from store");
        Ok(restored)
    }

    /// Stop every watcher and wait for them to finish.
    ///
    /// Orders stay on the exchange and records stay in the store so the
    /// next start resumes protection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<Arc<MonitorEntry>> = self.entries.read().await.values().cloned().collect();
        for entry in entries {
            if let Some(handle) = entry.take_task() {
                if let Err(e) = handle.await {
                    warn!(key = %entry.key, error = %e, "Watcher task ended abnormally");
                }
            }
        }
        let flushed = self.services.persistence.flush().await;
        info!(flushed, "Registry shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================
