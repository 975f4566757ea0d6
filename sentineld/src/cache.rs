//! Whole-account exchange snapshots shared by every watcher.
//!
//! One snapshot per account holds all open positions and all open orders.
//! Any number of watchers read it; the exchange is hit at most once per
//! refresh interval per account.
//!
//! # Freshness
//!
//! A snapshot is served while younger than its TTL (shorter during an active
//! execution window). An expired or invalidated snapshot is refreshed
//! synchronously before returning, so callers never get an empty or stale
//! view because of timing. A failed refresh returns the error; the previous
//! snapshot stays in place for later callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use sentinel_domain::{Account, Side, Symbol};
use sentinel_exec::{ExchangeOrder, ExchangePosition, ExchangeRouter, ExecError, ExecResult};

use crate::config::CacheConfig;

// =============================================================================
// Snapshot
// =============================================================================

/// Everything open on one account at one instant.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account: Account,
    pub positions: Vec<ExchangePosition>,
    pub open_orders: Vec<ExchangeOrder>,
    pub fetched_at: DateTime<Utc>,
    /// Strictly increasing across all refreshes
    pub sequence: u64,
}

impl AccountSnapshot {
    /// Position for `(symbol, side)`, if open
    pub fn position(&self, symbol: &Symbol, side: Side) -> Option<&ExchangePosition> {
        self.positions
            .iter()
            .find(|p| p.symbol == *symbol && p.side == side)
    }

    /// Open orders belonging to the `(symbol, side)` position
    pub fn orders_for(&self, symbol: &Symbol, side: Side) -> Vec<&ExchangeOrder> {
        self.open_orders
            .iter()
            .filter(|o| o.symbol == *symbol && o.belongs_to(side))
            .collect()
    }

    /// Whether an order is still resting
    pub fn is_open(&self, order_id: &str) -> bool {
        self.open_orders.iter().any(|o| o.order_id == order_id)
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Default)]
struct Slot {
    snapshot: Option<Arc<AccountSnapshot>>,
    last_refresh: Option<Instant>,
    active_until: Option<Instant>,
    invalidated: bool,
}

/// Bounded-TTL snapshot cache, one slot per configured account.
pub struct ExchangeStateCache {
    router: ExchangeRouter,
    config: CacheConfig,
    slots: HashMap<Account, Mutex<Slot>>,
    sequence: AtomicU64,
    refreshes: AtomicU64,
}

impl ExchangeStateCache {
    pub fn new(router: ExchangeRouter, config: CacheConfig) -> Self {
        let slots = router
            .accounts()
            .into_iter()
            .map(|account| (account, Mutex::new(Slot::default())))
            .collect();
        Self {
            router,
            config,
            slots,
            sequence: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    fn slot(&self, account: Account) -> ExecResult<&Mutex<Slot>> {
        self.slots
            .get(&account)
            .ok_or_else(|| ExecError::Config(format!("no exchange configured for {account} account")))
    }

    /// Current snapshot for `account`, refreshing first if it expired.
    pub async fn snapshot(&self, account: Account) -> ExecResult<Arc<AccountSnapshot>> {
        let mut slot = self.slot(account)?.lock().await;
        let now = Instant::now();

        if let (Some(snapshot), Some(at)) = (&slot.snapshot, slot.last_refresh) {
            let active = slot.active_until.is_some_and(|until| now < until);
            let ttl = if active { self.config.ttl_active } else { self.config.ttl_normal };
            let age = now.duration_since(at);
            if !slot.invalidated && age < ttl {
                return Ok(Arc::clone(snapshot));
            }
            if age < self.config.min_refresh_interval {
                tokio::time::sleep(self.config.min_refresh_interval - age).await;
            }
        }

        let exchange = self.router.for_account(account)?;
        let positions = exchange.get_positions(None).await?;
        let open_orders = exchange.get_open_orders(None).await?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let snapshot = Arc::new(AccountSnapshot {
            account,
            positions,
            open_orders,
            fetched_at: Utc::now(),
            sequence,
        });
        debug!(
            %account,
            sequence,
            positions = snapshot.positions.len(),
            orders = snapshot.open_orders.len(),
            "Exchange snapshot refreshed"
        );

        slot.snapshot = Some(Arc::clone(&snapshot));
        slot.last_refresh = Some(Instant::now());
        slot.invalidated = false;
        Ok(snapshot)
    }

    /// Use the short TTL for `account` for the configured window.
    pub async fn begin_active_window(&self, account: Account) {
        if let Ok(slot) = self.slot(account) {
            slot.lock().await.active_until = Some(Instant::now() + self.config.active_window);
        }
    }

    /// Force the next read of `account` to refresh.
    pub async fn invalidate(&self, account: Account) {
        if let Ok(slot) = self.slot(account) {
            slot.lock().await.invalidated = true;
        }
    }

    /// Total refreshes performed across all accounts
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
