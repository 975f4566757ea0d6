//! TP ladder and stop resizing.
//!
//! Whenever the tracked size changes, every still-pending TP slot is resized
//! to `size × percentage / 100` (snapped down to the lot step), and the stop
//! is resized to the tracked exposure. Every change is a cancel-then-place
//! pair: a replacement is never placed before the cancel of the order it
//! replaces succeeded, so a failed cancel never leaves two orders resting.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use sentinel_domain::{
    InstrumentRules, Price, ProtectionStatus, Quantity, SlOrder, TpLadder, TpOrder, TpStatus,
};
use sentinel_exec::{cancel_lenient, place_with_retry, ExchangeRouter, OrderRequest, RetryPolicy};

use crate::config::{InstrumentCatalog, ProtectionConfig};
use crate::error::DaemonResult;
use crate::event_bus::{DaemonEvent, EventBus};
use crate::guard::ConcurrencyGuard;
use crate::registry::MonitorEntry;

// =============================================================================
// Ladder arithmetic
// =============================================================================

/// Split `size` across `percentages`, snapped down to the lot step.
///
/// Percentages are renormalised to sum to 100. The last slot absorbs the
/// rounding remainder, so the total is `size` snapped down to the lot step.
pub fn ladder_quantities(size: Quantity, percentages: &[Decimal], rules: &InstrumentRules) -> Vec<Quantity> {
    let total: Decimal = percentages.iter().copied().sum();
    if percentages.is_empty() || total <= Decimal::ZERO {
        return Vec::new();
    }
    let size = size.as_decimal();
    let mut out = Vec::with_capacity(percentages.len());
    let mut allocated = Decimal::ZERO;
    for (i, pct) in percentages.iter().enumerate() {
        let qty = if i + 1 == percentages.len() {
            rules.snap_qty(size - allocated)
        } else {
            rules.snap_qty(size * pct / total)
        };
        allocated += qty.as_decimal();
        out.push(qty);
    }
    out
}

/// Renormalise `percentages` to sum to 100.
pub fn renormalise(percentages: &[Decimal]) -> Vec<Decimal> {
    let total: Decimal = percentages.iter().copied().sum();
    if total <= Decimal::ZERO {
        return percentages.to_vec();
    }
    percentages
        .iter()
        .map(|p| p * Decimal::ONE_HUNDRED / total)
        .collect()
}

// =============================================================================
// Reports
// =============================================================================

/// What a rebalance did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Size the ladder was computed for
    pub size: Quantity,
    /// Slots cancelled and re-placed (or placed after an earlier failure)
    pub replaced: usize,
    /// Slots removed for falling below the minimum notional
    pub dropped: usize,
    /// Slots whose cancel or placement failed
    pub failed: usize,
    pub unchanged: usize,
}

/// What a stop resize did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopResize {
    /// Stop already matches the exposure
    Unchanged,
    /// Stop cancelled and re-placed for the new quantity
    Resized { from: Quantity, to: Quantity },
    /// A stop was placed where none was live
    Placed { quantity: Quantity },
    /// A breakeven cascade holds the stop; it sets the quantity itself
    Deferred,
    /// The cancel failed; the previous stop is still live
    CancelFailed,
}

struct Slot {
    tp_number: u8,
    price: Price,
    order_id: Option<String>,
    live: bool,
    quantity: Quantity,
    percentage: Decimal,
    base_pct: Decimal,
}

// =============================================================================
// Rebalancer
// =============================================================================

pub struct OrderRebalancer {
    router: ExchangeRouter,
    guard: Arc<ConcurrencyGuard>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    catalog: InstrumentCatalog,
    ladder: TpLadder,
    protection: ProtectionConfig,
}

impl OrderRebalancer {
    pub fn new(
        router: ExchangeRouter,
        guard: Arc<ConcurrencyGuard>,
        bus: Arc<EventBus>,
        retry: RetryPolicy,
        catalog: InstrumentCatalog,
        ladder: TpLadder,
        protection: ProtectionConfig,
    ) -> Self {
        Self { router, guard, bus, retry, catalog, ladder, protection }
    }

    /// Resize the pending TP slots to the current remaining size.
    pub async fn rebalance(&self, entry: &MonitorEntry) -> DaemonResult<RebalanceReport> {
        let _rebalance = self.guard.lock_rebalance(&entry.key).await;

        let record = entry.snapshot();
        let rules = self.catalog.rules_for(&record.symbol);
        let size = record.remaining_size;
        let mut report = RebalanceReport { size, ..RebalanceReport::default() };

        let mut slots: Vec<Slot> = record
            .tp_orders
            .iter()
            .filter(|t| t.is_pending())
            .map(|t| Slot {
                tp_number: t.tp_number,
                price: t.price,
                order_id: t.order_id.clone(),
                live: t.is_live(),
                quantity: t.quantity,
                percentage: t.percentage,
                base_pct: self.base_percentage(t),
            })
            .collect();
        slots.sort_by_key(|s| s.tp_number);
        if slots.is_empty() || size.is_zero() {
            return Ok(report);
        }

        // Fold slots below the minimum notional into the first slot
        let mut dropped: Vec<Slot> = Vec::new();
        let targets = loop {
            let pcts = renormalise(&slots.iter().map(|s| s.base_pct).collect::<Vec<_>>());
            let qtys = ladder_quantities(size, &pcts, &rules);
            let failing = slots
                .iter()
                .zip(&qtys)
                .rposition(|(slot, qty)| !rules.meets_min_notional(*qty, slot.price));
            match failing {
                None => break pcts.into_iter().zip(qtys).collect::<Vec<_>>(),
                Some(idx) => {
                    let slot = slots.remove(idx);
                    if let Some(first) = slots.first_mut() {
                        first.base_pct += slot.base_pct;
                    }
                    dropped.push(slot);
                    if slots.is_empty() {
                        break Vec::new();
                    }
                }
            }
        };

        let exchange = self.router.for_account(entry.key.account)?;

        for slot in dropped {
            if slot.live {
                if let Some(order_id) = &slot.order_id {
                    if let Err(e) = cancel_lenient(exchange.as_ref(), &self.retry, &entry.key.symbol, order_id).await {
                        warn!(key = %entry.key, tp = slot.tp_number, error = %e, "Cancel of sub-minimum TP failed");
                        report.failed += 1;
                        continue;
                    }
                }
            }
            debug!(key = %entry.key, tp = slot.tp_number, "TP below minimum notional, removed from ladder");
            Self::set_slot(entry, slot.tp_number, |t| {
                t.status = TpStatus::Cancelled;
                t.order_id = None;
                t.percentage = Decimal::ZERO;
            });
            report.dropped += 1;
        }

        for (slot, (pct, qty)) in slots.iter().zip(targets) {
            if slot.live && slot.quantity == qty {
                if slot.percentage != pct {
                    Self::set_slot(entry, slot.tp_number, |t| t.percentage = pct);
                }
                report.unchanged += 1;
                continue;
            }

            if slot.live {
                if let Some(order_id) = &slot.order_id {
                    if let Err(e) = cancel_lenient(exchange.as_ref(), &self.retry, &entry.key.symbol, order_id).await {
                        warn!(key = %entry.key, tp = slot.tp_number, error = %e, "TP cancel failed, slot left as is");
                        report.failed += 1;
                        continue;
                    }
                }
                Self::set_slot(entry, slot.tp_number, |t| {
                    t.status = TpStatus::Unplaced;
                    t.order_id = None;
                });
            }

            let request = OrderRequest::take_profit(&entry.key.symbol, entry.key.side, slot.price, qty);
            match place_with_retry(exchange.as_ref(), &self.retry, &request).await {
                Ok(order_id) => {
                    Self::set_slot(entry, slot.tp_number, |t| {
                        t.order_id = Some(order_id);
                        t.status = TpStatus::Open;
                        t.quantity = qty;
                        t.percentage = pct;
                    });
                    report.replaced += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, tp = slot.tp_number, error = %e, "TP placement failed, slot kept unplaced");
                    Self::set_slot(entry, slot.tp_number, |t| {
                        t.status = TpStatus::Unplaced;
                        t.order_id = None;
                        t.quantity = qty;
                        t.percentage = pct;
                    });
                    report.failed += 1;
                }
            }
        }

        if report.replaced + report.dropped + report.failed > 0 {
            info!(
                key = %entry.key,
                size = %size,
                replaced = report.replaced,
                dropped = report.dropped,
                failed = report.failed,
                "TP ladder rebalanced"
            );
            self.bus.send(DaemonEvent::Rebalanced {
                key: entry.key.clone(),
                size,
                replaced: report.replaced,
                failed: report.failed,
            });
        }
        Ok(report)
    }

    /// Resize the stop to the tracked exposure.
    ///
    /// While BUILDING the exposure includes resting entry legs; afterwards it
    /// is the remaining size. A stop that is not live is re-placed.
    pub async fn resize_stop(&self, entry: &MonitorEntry) -> DaemonResult<StopResize> {
        let _rebalance = self.guard.lock_rebalance(&entry.key).await;
        let Some(_breakeven) = self.guard.try_breakeven(&entry.key) else {
            return Ok(StopResize::Deferred);
        };

        let record = entry.snapshot();
        let exposure = record.tracked_exposure();
        if exposure.is_zero() {
            return Ok(StopResize::Unchanged);
        }
        if let Some(sl) = record.sl_order.as_ref() {
            if sl.live && sl.quantity == exposure {
                return Ok(StopResize::Unchanged);
            }
        }

        let exchange = self.router.for_account(entry.key.account)?;
        let rules = self.catalog.rules_for(&record.symbol);
        let trigger_price = match record.sl_order.as_ref() {
            Some(sl) => sl.trigger_price,
            None => rules.snap_price(
                record
                    .side
                    .adverse(record.entry_price.as_decimal(), self.protection.orphan_stop_distance),
            )?,
        };

        let previous = record.sl_order.as_ref().filter(|sl| sl.live).cloned();
        if let Some(sl) = &previous {
            if let Err(e) = cancel_lenient(exchange.as_ref(), &self.retry, &record.symbol, &sl.order_id).await {
                warn!(key = %entry.key, order_id = %sl.order_id, error = %e, "Stop cancel failed, keeping previous stop");
                return Ok(StopResize::CancelFailed);
            }
            entry.update(|m| {
                if let Some(sl) = m.sl_order.as_mut() {
                    sl.live = false;
                }
            });
        }

        let request = OrderRequest::stop_loss(&record.symbol, record.side, trigger_price, exposure);
        match place_with_retry(exchange.as_ref(), &self.retry, &request).await {
            Ok(order_id) => {
                info!(key = %entry.key, %order_id, quantity = %exposure, price = %trigger_price, "Stop resized");
                entry.update(|m| {
                    let covers_full_position = !m.tp1_hit;
                    m.sl_order = Some(SlOrder {
                        order_id: order_id.clone(),
                        trigger_price,
                        quantity: exposure,
                        covers_full_position,
                        live: true,
                    });
                    if m.protection.status != ProtectionStatus::EmergencyMode {
                        m.protection.status = ProtectionStatus::Protected;
                    }
                    m.protection.sl_order_id = Some(order_id);
                    m.protection.sl_price = Some(trigger_price);
                    m.protection.updated_at = Utc::now();
                });
                Ok(match previous {
                    Some(sl) => StopResize::Resized { from: sl.quantity, to: exposure },
                    None => StopResize::Placed { quantity: exposure },
                })
            }
            Err(e) => {
                entry.update(|m| {
                    m.protection.status = ProtectionStatus::Unprotected;
                    m.protection.updated_at = Utc::now();
                });
                Err(e.into())
            }
        }
    }

    fn base_percentage(&self, tp: &TpOrder) -> Decimal {
        let idx = usize::from(tp.tp_number).saturating_sub(1);
        self.ladder
            .percentages()
            .get(idx)
            .copied()
            .unwrap_or(tp.percentage)
    }

    fn set_slot(entry: &MonitorEntry, tp_number: u8, f: impl FnOnce(&mut TpOrder)) {
        entry.update(|m| {
            if let Some(slot) = m.tp_orders.iter_mut().find(|t| t.tp_number == tp_number) {
                f(slot);
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use rust_decimal_macros::dec;
    use sentinel_domain::{Account, MonitorKey, Phase, PositionMonitor, Side, Symbol};
    use sentinel_exec::{ExchangePort, Injected, StubExchange};
    use tokio_util::sync::CancellationToken;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    fn qty(v: Decimal) -> Quantity {
        Quantity::new(v).unwrap()
    }

    fn price(v: Decimal) -> Price {
        Price::new(v).unwrap()
    }

    fn rebalancer(stub: Arc<StubExchange>) -> OrderRebalancer {
        let config = Config::test();
        OrderRebalancer::new(
            ExchangeRouter::new(stub),
            Arc::new(ConcurrencyGuard::new()),
            Arc::new(EventBus::new(16)),
            config.retry,
            config.instruments,
            config.ladder,
            config.protection,
        )
    }

    /// Long 100 @ 100 with a full 85/5/5/5 ladder and a stop at 99.
    async fn setup() -> (Arc<StubExchange>, MonitorEntry) {
        let stub = Arc::new(StubExchange::new(dec!(100)));
        stub.set_position(&btc(), Side::Long, dec!(100), dec!(100));
        let key = MonitorKey::new(btc(), Side::Long, Account::Primary);

        let sl_id = stub
            .place_order(&OrderRequest::stop_loss(&btc(), Side::Long, price(dec!(99)), qty(dec!(100))))
            .await
            .unwrap();
        let mut record = PositionMonitor::new(&key, price(dec!(100)), qty(dec!(100)), "ops").with_stop(SlOrder {
            order_id: sl_id,
            trigger_price: price(dec!(99)),
            quantity: qty(dec!(100)),
            covers_full_position: true,
            live: true,
        });
        for (n, (p, q)) in [(dec!(101), dec!(85)), (dec!(102), dec!(5)), (dec!(103), dec!(5)), (dec!(104), dec!(5))]
            .into_iter()
            .enumerate()
        {
            let id = stub
                .place_order(&OrderRequest::take_profit(&btc(), Side::Long, price(p), qty(q)))
                .await
                .unwrap();
            record.tp_orders.push(TpOrder {
                order_id: Some(id),
                tp_number: (n + 1) as u8,
                price: price(p),
                quantity: qty(q),
                percentage: q,
                status: TpStatus::Open,
                filled_at: None,
            });
        }
        (stub, MonitorEntry::new(record, CancellationToken::new()))
    }

    fn live_tp_total(entry: &MonitorEntry) -> Decimal {
        entry.snapshot().live_tp_quantity().as_decimal()
    }

    #[test]
    fn test_ladder_quantities_last_slot_absorbs_remainder() {
        let rules = InstrumentRules::new(dec!(1), dec!(0.01), dec!(0)).unwrap();
        let qtys = ladder_quantities(qty(dec!(10)), &[dec!(85), dec!(5), dec!(5), dec!(5)], &rules);
        let values: Vec<Decimal> = qtys.iter().map(|q| q.as_decimal()).collect();
        assert_eq!(values, vec![dec!(8), dec!(0), dec!(0), dec!(2)]);
    }

    #[test]
    fn test_renormalise_pending_rungs() {
        assert_eq!(renormalise(&[dec!(5), dec!(5)]), vec![dec!(50), dec!(50)]);
        assert_eq!(renormalise(&[dec!(85), dec!(15)]), vec![dec!(85), dec!(15)]);
    }

    #[tokio::test]
    async fn test_entry_fill_grows_ladder() {
        let (stub, entry) = setup().await;
        entry.update(|m| m.remaining_size = qty(dec!(200)));

        let report = rebalancer(stub.clone()).rebalance(&entry).await.unwrap();

        assert_eq!(report.replaced, 4);
        assert_eq!(live_tp_total(&entry), dec!(200));
        let record = entry.snapshot();
        assert_eq!(record.tp_orders[0].quantity.as_decimal(), dec!(170));
        // Old TP orders were cancelled, new ones are resting
        assert_eq!(stub.open_orders().iter().filter(|o| !o.is_stop()).count(), 4);
    }

    #[tokio::test]
    async fn test_remaining_slots_renormalised_after_tp1() {
        let (stub, entry) = setup().await;
        entry.update(|m| {
            m.tp_orders[0].status = TpStatus::Filled;
            m.remaining_size = qty(dec!(30));
        });

        let report = rebalancer(stub).rebalance(&entry).await.unwrap();

        let record = entry.snapshot();
        let pcts: Vec<Decimal> = record.open_tps().map(|t| t.percentage.round_dp(4)).collect();
        assert_eq!(pcts.len(), 3);
        assert_eq!(pcts.iter().copied().sum::<Decimal>().round_dp(2), dec!(100));
        assert_eq!(live_tp_total(&entry), dec!(30));
        assert_eq!(report.replaced, 3);
    }

    #[tokio::test]
    async fn test_slots_already_sized_for_remainder_are_kept() {
        let (stub, entry) = setup().await;
        // 5/5/5 already covers the 15 left after TP1
        entry.update(|m| {
            m.tp_orders[0].status = TpStatus::Filled;
            m.remaining_size = qty(dec!(15));
        });
        let places = stub.calls().places;

        let report = rebalancer(stub.clone()).rebalance(&entry).await.unwrap();

        assert_eq!(report.replaced, 0);
        assert_eq!(report.unchanged, 3);
        assert_eq!(live_tp_total(&entry), dec!(15));
        assert_eq!(stub.calls().places, places);
    }

    #[tokio::test]
    async fn test_below_min_notional_slots_fold_into_first() {
        let (stub, entry) = setup().await;
        // 5% of 0.5 units at ~$100 is below the $5 minimum notional
        entry.update(|m| m.remaining_size = qty(dec!(0.5)));

        let report = rebalancer(stub).rebalance(&entry).await.unwrap();

        assert_eq!(report.dropped, 3);
        let record = entry.snapshot();
        let live: Vec<_> = record.open_tps().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].tp_number, 1);
        assert_eq!(live[0].quantity.as_decimal(), dec!(0.5));
        assert_eq!(live[0].percentage, dec!(100));
    }

    #[tokio::test]
    async fn test_cancel_failure_aborts_only_that_slot() {
        let (stub, entry) = setup().await;
        entry.update(|m| m.remaining_size = qty(dec!(200)));
        stub.script_cancels([Injected::Reject]);

        let report = rebalancer(stub.clone()).rebalance(&entry).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.replaced, 3);
        // No orphan placement: the failed slot keeps its original order
        assert_eq!(stub.open_orders().iter().filter(|o| !o.is_stop()).count(), 4);
        assert_eq!(entry.snapshot().tp_orders[0].quantity.as_decimal(), dec!(85));
    }

    #[tokio::test]
    async fn test_failed_placement_is_retried_next_rebalance() {
        let (stub, entry) = setup().await;
        entry.update(|m| m.remaining_size = qty(dec!(200)));
        stub.script_places([Injected::Reject]);

        let first = rebalancer(stub.clone()).rebalance(&entry).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(entry.snapshot().tp_orders[0].status, TpStatus::Unplaced);

        let second = rebalancer(stub).rebalance(&entry).await.unwrap();
        assert_eq!(second.replaced, 1);
        assert_eq!(live_tp_total(&entry), dec!(200));
    }

    #[tokio::test]
    async fn test_stop_covers_legs_while_building_only() {
        let (stub, entry) = setup().await;
        let rebalancer = rebalancer(stub.clone());
        entry.update(|m| {
            m.entry_legs.push(sentinel_domain::EntryLeg {
                order_id: "leg".into(),
                price: price(dec!(98)),
                quantity: qty(dec!(50)),
                status: sentinel_domain::EntryLegStatus::Open,
            });
        });

        let resized = rebalancer.resize_stop(&entry).await.unwrap();
        assert_eq!(resized, StopResize::Resized { from: qty(dec!(100)), to: qty(dec!(150)) });
        assert_eq!(stub.live_stops(&btc())[0].quantity.as_decimal(), dec!(150));

        entry.update(|m| {
            m.advance_phase(Phase::ProfitTaking, Utc::now()).unwrap();
            m.remaining_size = qty(dec!(15));
        });
        rebalancer.resize_stop(&entry).await.unwrap();
        let record = entry.snapshot();
        let sl = record.sl_order.as_ref().unwrap();
        assert_eq!(sl.quantity.as_decimal(), dec!(15));
        assert!(!sl.covers_full_position);
        assert_eq!(stub.live_stops(&btc()).len(), 1);
        assert!(record.sl_covers_exposure());
    }

    #[tokio::test]
    async fn test_stop_resize_defers_to_breakeven() {
        let (stub, entry) = setup().await;
        let guard = Arc::new(ConcurrencyGuard::new());
        let config = Config::test();
        let rebalancer = OrderRebalancer::new(
            ExchangeRouter::new(stub),
            guard.clone(),
            Arc::new(EventBus::new(4)),
            config.retry,
            config.instruments,
            config.ladder,
            config.protection,
        );
        entry.update(|m| m.remaining_size = qty(dec!(50)));

        let _held = guard.lock_breakeven(&entry.key).await;
        assert_eq!(rebalancer.resize_stop(&entry).await.unwrap(), StopResize::Deferred);
    }
}
