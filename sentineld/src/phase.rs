//! Lifecycle phase transitions.
//!
//! BUILDING → PROFIT_TAKING → CLOSED, forward only, under the position's
//! phase lock. Re-entering the current phase is a no-op. Side effects:
//!
//! - PROFIT_TAKING: cancel every still-open entry leg (best effort; a failed
//!   cancel does not block the transition and is retried on a later tick)
//! - CLOSED: cancel every order the monitor still owns (best effort)
//!
//! Persisting the change is the caller's job.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use sentinel_domain::{EntryLegStatus, Phase, PhaseChange, TpStatus};
use sentinel_exec::{cancel_lenient, ExchangeRouter, RetryPolicy};

use crate::error::DaemonResult;
use crate::event_bus::{DaemonEvent, EventBus};
use crate::guard::ConcurrencyGuard;
use crate::registry::MonitorEntry;

pub struct PhaseStateMachine {
    router: ExchangeRouter,
    guard: Arc<ConcurrencyGuard>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
}

impl PhaseStateMachine {
    pub fn new(router: ExchangeRouter, guard: Arc<ConcurrencyGuard>, bus: Arc<EventBus>, retry: RetryPolicy) -> Self {
        Self { router, guard, bus, retry }
    }

    /// Move `entry` to `target`.
    ///
    /// # Errors
    /// `DaemonError::Domain` when `target` is behind the current phase.
    pub async fn transition(&self, entry: &MonitorEntry, target: Phase) -> DaemonResult<PhaseChange> {
        let _phase = self.guard.lock_phase(&entry.key).await;

        let now = Utc::now();
        let change = entry.update(|m| m.advance_phase(target, now))?;
        let PhaseChange::Advanced { from, to } = change else {
            return Ok(change);
        };

        info!(key = %entry.key, %from, %to, "Phase advanced");

        match to {
            Phase::ProfitTaking => {
                self.cancel_entry_legs(entry).await;
            }
            Phase::Closed => {
                self.cancel_all_orders(entry).await;
            }
            Phase::Building => {}
        }

        self.bus.send(DaemonEvent::PhaseChanged {
            key: entry.key.clone(),
            from,
            to,
            at: now,
        });
        Ok(change)
    }

    /// Cancel every open entry leg. Returns how many are still open.
    pub async fn cancel_entry_legs(&self, entry: &MonitorEntry) -> usize {
        let legs: Vec<String> = entry
            .snapshot()
            .open_entry_legs()
            .map(|l| l.order_id.clone())
            .collect();
        if legs.is_empty() {
            return 0;
        }
        let exchange = match self.router.for_account(entry.key.account) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "No exchange to cancel entry legs on");
                return legs.len();
            }
        };

        let mut still_open = 0;
        for order_id in legs {
            match cancel_lenient(exchange.as_ref(), &self.retry, &entry.key.symbol, &order_id).await {
                Ok(outcome) => {
                    info!(key = %entry.key, order_id = %order_id, ?outcome, "Entry leg cancelled");
                    entry.update(|m| {
                        if let Some(leg) = m.entry_legs.iter_mut().find(|l| l.order_id == order_id) {
                            leg.status = EntryLegStatus::Cancelled;
                        }
                    });
                }
                Err(e) => {
                    warn!(key = %entry.key, order_id = %order_id, error = %e, "Entry leg cancel failed (will retry)");
                    still_open += 1;
                }
            }
        }
        still_open
    }

    /// Cancel every live order the monitor owns. Returns how many failed.
    pub async fn cancel_all_orders(&self, entry: &MonitorEntry) -> usize {
        let mut failed = self.cancel_entry_legs(entry).await;
        let exchange = match self.router.for_account(entry.key.account) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "No exchange to cancel orders on");
                return failed + 1;
            }
        };
        let record = entry.snapshot();

        for tp in record.open_tps() {
            let Some(order_id) = tp.order_id.clone() else { continue };
            match cancel_lenient(exchange.as_ref(), &self.retry, &entry.key.symbol, &order_id).await {
                Ok(_) => entry.update(|m| {
                    if let Some(slot) = m.tp_orders.iter_mut().find(|t| t.tp_number == tp.tp_number) {
                        slot.status = TpStatus::Cancelled;
                    }
                }),
                Err(e) => {
                    warn!(key = %entry.key, order_id = %order_id, error = %e, "Take-profit cancel failed");
                    failed += 1;
                }
            }
        }

        if let Some(sl) = record.sl_order.as_ref().filter(|sl| sl.live) {
            match cancel_lenient(exchange.as_ref(), &self.retry, &entry.key.symbol, &sl.order_id).await {
                Ok(_) => entry.update(|m| {
                    if let Some(sl) = m.sl_order.as_mut() {
                        sl.live = false;
                    }
                }),
                Err(e) => {
                    warn!(key = %entry.key, order_id = %sl.order_id, error = %e, "Stop cancel failed");
                    failed += 1;
                }
            }
        }
        failed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MonitorEntry;
    use rust_decimal_macros::dec;
    use sentinel_domain::{
        Account, EntryLeg, MonitorKey, PositionMonitor, Price, Quantity, Side, Symbol,
    };
    use sentinel_exec::{ExchangePort, Injected, OrderRequest, StubExchange};
    use tokio_util::sync::CancellationToken;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    async fn setup() -> (Arc<StubExchange>, PhaseStateMachine, MonitorEntry, Arc<EventBus>) {
        let stub = Arc::new(StubExchange::new(dec!(100)));
        let mut legs = Vec::new();
        for p in [dec!(98), dec!(97)] {
            let price = Price::new(p).unwrap();
            let qty = Quantity::new(dec!(20)).unwrap();
            let id = stub
                .place_order(&OrderRequest::entry_limit(&btc(), Side::Long, price, qty))
                .await
                .unwrap();
            legs.push(EntryLeg {
                order_id: id,
                price,
                quantity: qty,
                status: EntryLegStatus::Open,
            });
        }
        let key = MonitorKey::new(btc(), Side::Long, Account::Primary);
        let record = PositionMonitor::new(
            &key,
            Price::new(dec!(100)).unwrap(),
            Quantity::new(dec!(60)).unwrap(),
            "ops",
        )
        .with_entry_legs(legs);

        let bus = Arc::new(EventBus::new(16));
        let machine = PhaseStateMachine::new(
            ExchangeRouter::new(stub.clone()),
            Arc::new(ConcurrencyGuard::new()),
            bus.clone(),
            RetryPolicy {
                max_attempts: 2,
                backoff: std::time::Duration::from_millis(1),
            },
        );
        (stub, machine, MonitorEntry::new(record, CancellationToken::new()), bus)
    }

    #[tokio::test]
    async fn test_profit_taking_cancels_entry_legs() {
        let (stub, machine, entry, bus) = setup().await;
        let mut events = bus.subscribe();

        let change = machine.transition(&entry, Phase::ProfitTaking).await.unwrap();

        assert_eq!(change, PhaseChange::Advanced { from: Phase::Building, to: Phase::ProfitTaking });
        assert!(stub.open_orders().is_empty());
        let record = entry.snapshot();
        assert!(record.tp1_hit);
        assert_eq!(record.open_entry_legs().count(), 0);
        assert!(matches!(events.try_recv(), Some(Ok(DaemonEvent::PhaseChanged { .. }))));
    }

    #[tokio::test]
    async fn test_transition_is_idempotent() {
        let (stub, machine, entry, _bus) = setup().await;

        machine.transition(&entry, Phase::ProfitTaking).await.unwrap();
        let cancels = stub.calls().cancels;
        let again = machine.transition(&entry, Phase::ProfitTaking).await.unwrap();

        assert_eq!(again, PhaseChange::Unchanged);
        assert_eq!(stub.calls().cancels, cancels);
        assert!(machine.transition(&entry, Phase::Building).await.is_err());
    }

    #[tokio::test]
    async fn test_leg_cancel_failure_does_not_block_transition() {
        let (stub, machine, entry, _bus) = setup().await;
        stub.script_cancels([Injected::Reject]);

        machine.transition(&entry, Phase::ProfitTaking).await.unwrap();

        let record = entry.snapshot();
        assert_eq!(record.phase, Phase::ProfitTaking);
        assert_eq!(record.open_entry_legs().count(), 1);
        assert_eq!(stub.open_orders().len(), 1);

        assert_eq!(machine.cancel_entry_legs(&entry).await, 0);
        assert!(stub.open_orders().is_empty());
    }
}
