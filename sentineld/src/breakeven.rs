//! Breakeven failsafe cascade.
//!
//! Once TP1 is confirmed the stop moves to breakeven:
//! `entry × (1 ± (fee_rate + safety_margin))`. Four layers run in order under
//! the position's breakeven lock, stopping at the first verified success:
//!
//! 1. **Amend**: amend the live stop in place.
//! 2. **Cancel/replace**: cancel the stop and place a new one. If the new one
//!    fails or cannot be verified, the original stop is re-placed at its
//!    original price and quantity before the unverified order is removed.
//! 3. **Progressive**: place at increasing offsets from breakeven, placing
//!    first and cancelling the previous stop only after verification.
//! 4. **Emergency**: place at a fixed offset from the market price and mark
//!    the position EMERGENCY_MODE.
//!
//! Every placement is verified with a fresh open-order read. An unverified
//! placement counts as a failed layer. Each layer tried appends one entry to
//! the audit log. If all four fail the position is marked UNPROTECTED, a
//! critical alert goes out and `CriticalProtectionFailure` is returned; the
//! watcher keeps running and retries after the protection cooldown.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use sentinel_domain::{
    calculate_breakeven_price, BreakevenAttempt, BreakevenMethod, Price, ProtectionStatus, Quantity,
    Side, SlOrder, Symbol,
};
use sentinel_exec::{
    cancel_lenient, place_with_retry, verify_stop, ExchangePort, ExchangeRouter, OrderRequest,
    RetryPolicy, StopVerification,
};

use crate::alerts::{AlertDispatcher, AlertTemplate};
use crate::config::{InstrumentCatalog, ProtectionConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{DaemonEvent, EventBus};
use crate::guard::ConcurrencyGuard;
use crate::persistence::PersistenceWriter;
use crate::registry::MonitorEntry;

// =============================================================================
// Outcome
// =============================================================================

/// Result of one cascade run.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakevenOutcome {
    /// A layer succeeded and its stop is verified live
    Applied { method: BreakevenMethod, price: Price },
    /// The stop already sits at or beyond breakeven
    AlreadyAtBreakeven,
    /// Another cascade holds the lock for this position
    Busy,
    /// Nothing is held, so there is nothing to protect
    NothingToProtect,
}

/// Outcome of one layer
enum Layer {
    Success { order_id: String, price: Price },
    Failed(String),
}

/// Stop as it was when the cascade started
#[derive(Debug, Clone)]
struct OriginalStop {
    order_id: String,
    trigger_price: Price,
    quantity: Quantity,
}

struct Target<'a> {
    exchange: &'a dyn ExchangePort,
    symbol: &'a Symbol,
    side: Side,
    quantity: Quantity,
}

// =============================================================================
// Cascade
// =============================================================================

pub struct BreakevenCascade {
    router: ExchangeRouter,
    guard: Arc<ConcurrencyGuard>,
    bus: Arc<EventBus>,
    alerts: AlertDispatcher,
    persistence: Arc<PersistenceWriter>,
    retry: RetryPolicy,
    protection: ProtectionConfig,
    catalog: InstrumentCatalog,
}

impl BreakevenCascade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: ExchangeRouter,
        guard: Arc<ConcurrencyGuard>,
        bus: Arc<EventBus>,
        alerts: AlertDispatcher,
        persistence: Arc<PersistenceWriter>,
        retry: RetryPolicy,
        protection: ProtectionConfig,
        catalog: InstrumentCatalog,
    ) -> Self {
        Self { router, guard, bus, alerts, persistence, retry, protection, catalog }
    }

    /// Breakeven stop price for `entry`'s own entry price, snapped to tick.
    pub fn breakeven_price(&self, entry: &MonitorEntry) -> DaemonResult<Price> {
        let record = entry.snapshot();
        let raw = calculate_breakeven_price(
            record.entry_price,
            record.side,
            self.protection.fee_rate,
            self.protection.safety_margin,
        )?;
        Ok(self.catalog.rules_for(&record.symbol).snap_price(raw.as_decimal())?)
    }

    /// Run the cascade for `entry`.
    ///
    /// # Errors
    /// `DaemonError::CriticalProtectionFailure` when every layer failed.
    pub async fn apply(&self, entry: &MonitorEntry) -> DaemonResult<BreakevenOutcome> {
        let Some(_breakeven) = self.guard.try_breakeven(&entry.key) else {
            debug!(key = %entry.key, "Breakeven already in flight");
            return Ok(BreakevenOutcome::Busy);
        };

        let record = entry.snapshot();
        if record.sl_moved_to_breakeven {
            return Ok(BreakevenOutcome::AlreadyAtBreakeven);
        }
        let quantity = record.tracked_exposure();
        if quantity.is_zero() {
            return Ok(BreakevenOutcome::NothingToProtect);
        }

        let breakeven = self.breakeven_price(entry)?;
        let original = record
            .sl_order
            .as_ref()
            .filter(|sl| sl.live)
            .map(|sl| OriginalStop {
                order_id: sl.order_id.clone(),
                trigger_price: sl.trigger_price,
                quantity: sl.quantity,
            });

        // Directional guard: breakeven must improve on the live stop
        if let Some(orig) = &original {
            if !record.side.improves_stop(breakeven, orig.trigger_price) {
                info!(
                    key = %entry.key,
                    current = %orig.trigger_price,
                    %breakeven,
                    "Stop already at or beyond breakeven"
                );
                let recovered = record.protection.status != ProtectionStatus::Protected;
                entry.update(|m| {
                    m.sl_moved_to_breakeven = true;
                    m.protection.status = ProtectionStatus::Protected;
                    m.protection.sl_order_id = Some(orig.order_id.clone());
                    m.protection.sl_price = Some(orig.trigger_price);
                    m.protection.updated_at = Utc::now();
                });
                if recovered {
                    info!(key = %entry.key, previous = %record.protection.status, "Live stop protects beyond breakeven");
                }
                if let Err(e) = self.persistence.save_now(&entry.snapshot()).await {
                    warn!(key = %entry.key, error = %e, "Breakeven record not persisted yet");
                }
                return Ok(BreakevenOutcome::AlreadyAtBreakeven);
            }
        }

        let exchange = self.router.for_account(entry.key.account)?;
        let target = Target {
            exchange: exchange.as_ref(),
            symbol: &entry.key.symbol,
            side: entry.key.side,
            quantity,
        };

        info!(key = %entry.key, %breakeven, %quantity, "Moving stop to breakeven");

        let mut errors = Vec::new();
        let methods = [
            BreakevenMethod::Amend,
            BreakevenMethod::CancelReplace,
            BreakevenMethod::ProgressiveRetry,
            BreakevenMethod::EmergencyManual,
        ];
        for method in methods {
            let layer = match method {
                BreakevenMethod::Amend => self.amend(entry, &target, original.as_ref(), breakeven).await,
                BreakevenMethod::CancelReplace => {
                    self.cancel_replace(entry, &target, original.as_ref(), breakeven).await
                }
                BreakevenMethod::ProgressiveRetry => self.progressive(entry, &target, breakeven).await,
                BreakevenMethod::EmergencyManual => self.emergency(entry, &target).await,
            };

            match layer {
                Layer::Success { order_id, price } => {
                    self.succeed(entry, method, order_id, price, quantity).await;
                    return Ok(BreakevenOutcome::Applied { method, price });
                }
                Layer::Failed(reason) => {
                    warn!(key = %entry.key, %method, %reason, "Breakeven layer failed");
                    entry.update(|m| {
                        m.record_attempt(BreakevenAttempt {
                            method,
                            at: Utc::now(),
                            success: false,
                            price: None,
                            error: Some(reason.clone()),
                        })
                    });
                    errors.push(format!("{method}: {reason}"));
                }
            }
        }

        Err(self.fail(entry, errors.join("; ")).await)
    }

    // -------------------------------------------------------------------------
    // Layers
    // -------------------------------------------------------------------------

    async fn amend(
        &self,
        entry: &MonitorEntry,
        target: &Target<'_>,
        original: Option<&OriginalStop>,
        price: Price,
    ) -> Layer {
        let Some(orig) = original else {
            return Layer::Failed("no live stop to amend".into());
        };
        let amended = self
            .retry
            .retry_transient("amend_order", || {
                target
                    .exchange
                    .amend_order(target.symbol, &orig.order_id, Some(price), Some(target.quantity))
            })
            .await;
        if let Err(e) = amended {
            return Layer::Failed(format!("amend rejected: {e}"));
        }
        match self.verify(entry, target, &orig.order_id, price).await {
            Ok(()) => Layer::Success {
                order_id: orig.order_id.clone(),
                price,
            },
            Err(reason) => Layer::Failed(reason),
        }
    }

    async fn cancel_replace(
        &self,
        entry: &MonitorEntry,
        target: &Target<'_>,
        original: Option<&OriginalStop>,
        price: Price,
    ) -> Layer {
        if let Some(orig) = original {
            if let Err(e) = cancel_lenient(target.exchange, &self.retry, target.symbol, &orig.order_id).await {
                return Layer::Failed(format!("cancel of current stop failed: {e}"));
            }
            entry.update(|m| {
                if let Some(sl) = m.sl_order.as_mut() {
                    sl.live = false;
                }
            });
        }

        let request = OrderRequest::stop_loss(target.symbol, target.side, price, target.quantity);
        let (placed, reason) = match place_with_retry(target.exchange, &self.retry, &request).await {
            Ok(order_id) => match self.verify(entry, target, &order_id, price).await {
                Ok(()) => return Layer::Success { order_id, price },
                Err(reason) => (Some(order_id), reason),
            },
            Err(e) => (None, format!("placement failed: {e}")),
        };

        // The current stop is gone; put the original back before cleaning up
        if let Some(orig) = original {
            self.rollback(entry, target, orig).await;
        }
        if let Some(order_id) = placed {
            self.discard(target, &order_id).await;
        }
        Layer::Failed(reason)
    }

    async fn progressive(&self, entry: &MonitorEntry, target: &Target<'_>, breakeven: Price) -> Layer {
        let rules = self.catalog.rules_for(target.symbol);
        let mut last_reason = String::from("no offsets configured");

        for (i, offset) in self.protection.progressive_offsets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.protection.step_delay).await;
            }
            let price = match rules.snap_price(target.side.adverse(breakeven.as_decimal(), *offset)) {
                Ok(p) => p,
                Err(e) => {
                    last_reason = format!("offset {offset}: {e}");
                    continue;
                }
            };
            let current = entry.snapshot().sl_order.filter(|sl| sl.live);
            if let Some(sl) = &current {
                if !target.side.improves_stop(price, sl.trigger_price) {
                    last_reason = format!("offset {offset}: {price} does not improve on {}", sl.trigger_price);
                    continue;
                }
            }

            match self.place_verified(entry, target, price).await {
                Ok(order_id) => {
                    if let Some(sl) = current {
                        self.discard(target, &sl.order_id).await;
                    }
                    return Layer::Success { order_id, price };
                }
                Err(reason) => {
                    debug!(key = %entry.key, %offset, %reason, "Progressive attempt failed");
                    last_reason = format!("offset {offset}: {reason}");
                }
            }
        }
        Layer::Failed(last_reason)
    }

    async fn emergency(&self, entry: &MonitorEntry, target: &Target<'_>) -> Layer {
        let mark = match target.exchange.get_current_price(target.symbol).await {
            Ok(p) => p,
            Err(e) => return Layer::Failed(format!("no market price: {e}")),
        };
        let rules = self.catalog.rules_for(target.symbol);
        let price = match rules.snap_price(target.side.adverse(mark.as_decimal(), self.protection.emergency_offset)) {
            Ok(p) => p,
            Err(e) => return Layer::Failed(e.to_string()),
        };

        let current = entry.snapshot().sl_order.filter(|sl| sl.live);
        match self.place_verified(entry, target, price).await {
            Ok(order_id) => {
                if let Some(sl) = current {
                    self.discard(target, &sl.order_id).await;
                }
                Layer::Success { order_id, price }
            }
            Err(reason) => Layer::Failed(reason),
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Place a stop and verify it; an unverified stop is cancelled again.
    async fn place_verified(&self, entry: &MonitorEntry, target: &Target<'_>, price: Price) -> Result<String, String> {
        let request = OrderRequest::stop_loss(target.symbol, target.side, price, target.quantity);
        let order_id = place_with_retry(target.exchange, &self.retry, &request)
            .await
            .map_err(|e| format!("placement failed: {e}"))?;
        match self.verify(entry, target, &order_id, price).await {
            Ok(()) => Ok(order_id),
            Err(reason) => {
                self.discard(target, &order_id).await;
                Err(reason)
            }
        }
    }

    /// Confirm the stop is live at `price` with fresh open-order reads.
    ///
    /// A placement that cannot be verified marks the position
    /// VERIFICATION_FAILED until a later layer succeeds or the cascade gives up.
    async fn verify(&self, entry: &MonitorEntry, target: &Target<'_>, order_id: &str, price: Price) -> Result<(), String> {
        let result = self.read_back(entry, target, order_id, price).await;
        if let Err(reason) = &result {
            warn!(key = %entry.key, order_id, %reason, "Stop placement not verified");
            entry.update(|m| {
                m.protection.status = ProtectionStatus::VerificationFailed;
                m.protection.updated_at = Utc::now();
            });
        }
        result
    }

    /// A missing order is re-read up to `verification_reads` times; a stop
    /// live at the wrong trigger fails at once.
    async fn read_back(&self, entry: &MonitorEntry, target: &Target<'_>, order_id: &str, price: Price) -> Result<(), String> {
        let reads = self.protection.verification_reads.max(1);
        for read in 1..=reads {
            entry.update(|m| m.protection.verification_attempts += 1);
            let result = verify_stop(
                target.exchange,
                target.symbol,
                order_id,
                price,
                Some(target.quantity),
                self.protection.verify_tolerance,
            )
            .await;
            match result {
                Ok(StopVerification::Confirmed(_)) => return Ok(()),
                Ok(StopVerification::Mismatch(order)) => {
                    let seen = order
                        .trigger_price
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "none".into());
                    return Err(format!(
                        "verification mismatch: expected {price} x {}, saw {seen} x {}",
                        target.quantity, order.quantity
                    ));
                }
                Ok(StopVerification::Missing) => {
                    debug!(order_id, read, "Stop not visible yet");
                }
                Err(e) if e.is_transient() => {
                    debug!(order_id, read, error = %e, "Verification read failed");
                }
                Err(e) => return Err(format!("verification read failed: {e}")),
            }
            if read < reads {
                tokio::time::sleep(self.protection.step_delay).await;
            }
        }
        Err(format!("order {order_id} not visible after {reads} reads"))
    }

    /// Re-place the stop that was live before the cascade.
    async fn rollback(&self, entry: &MonitorEntry, target: &Target<'_>, orig: &OriginalStop) {
        let request = OrderRequest::stop_loss(target.symbol, target.side, orig.trigger_price, orig.quantity);
        match place_with_retry(target.exchange, &self.retry, &request).await {
            Ok(order_id) => {
                warn!(
                    key = %entry.key,
                    %order_id,
                    price = %orig.trigger_price,
                    quantity = %orig.quantity,
                    "Rolled back to original stop"
                );
                entry.update(|m| {
                    let covers_full_position = orig.quantity >= m.tracked_exposure() && !m.tp1_hit;
                    m.sl_order = Some(SlOrder {
                        order_id: order_id.clone(),
                        trigger_price: orig.trigger_price,
                        quantity: orig.quantity,
                        covers_full_position,
                        live: true,
                    });
                    m.protection.sl_order_id = Some(order_id);
                    m.protection.sl_price = Some(orig.trigger_price);
                });
            }
            Err(e) => {
                error!(key = %entry.key, error = %e, "Rollback to original stop failed");
                entry.update(|m| {
                    m.protection.status = ProtectionStatus::Unprotected;
                    m.protection.updated_at = Utc::now();
                });
            }
        }
    }

    /// Best-effort cancel of a stop that is no longer wanted.
    async fn discard(&self, target: &Target<'_>, order_id: &str) {
        if let Err(e) = cancel_lenient(target.exchange, &self.retry, target.symbol, order_id).await {
            warn!(order_id, error = %e, "Failed to cancel superseded stop");
        }
    }

    async fn succeed(&self, entry: &MonitorEntry, method: BreakevenMethod, order_id: String, price: Price, quantity: Quantity) {
        let emergency = method == BreakevenMethod::EmergencyManual;
        let now = Utc::now();
        entry.update(|m| {
            m.sl_order = Some(SlOrder {
                order_id: order_id.clone(),
                trigger_price: price,
                quantity,
                covers_full_position: !m.tp1_hit,
                live: true,
            });
            m.sl_moved_to_breakeven = !emergency;
            m.protection.status = if emergency {
                ProtectionStatus::EmergencyMode
            } else {
                ProtectionStatus::Protected
            };
            m.protection.sl_order_id = Some(order_id.clone());
            m.protection.sl_price = Some(price);
            m.protection.updated_at = now;
            m.record_attempt(BreakevenAttempt {
                method,
                at: now,
                success: true,
                price: Some(price),
                error: None,
            });
        });

        let record = entry.snapshot();
        if let Err(e) = self.persistence.save_now(&record).await {
            warn!(key = %entry.key, error = %e, "Breakeven record not persisted yet");
        }

        if emergency {
            warn!(key = %entry.key, %order_id, %price, "Emergency stop placed");
        } else {
            info!(key = %entry.key, %order_id, %price, %method, "Stop moved to breakeven");
        }
        self.bus.send(DaemonEvent::BreakevenApplied {
            key: entry.key.clone(),
            method,
            price,
        });
        let template = if emergency {
            AlertTemplate::EmergencyProtection
        } else {
            AlertTemplate::BreakevenApplied
        };
        self.alerts.dispatch(
            &record.alert_target,
            template,
            json!({
                "key": entry.key.to_string(),
                "method": method.to_string(),
                "price": price.to_string(),
                "quantity": quantity.to_string(),
            }),
        );
    }

    async fn fail(&self, entry: &MonitorEntry, detail: String) -> DaemonError {
        entry.update(|m| {
            m.protection.status = ProtectionStatus::Unprotected;
            m.protection.updated_at = Utc::now();
        });
        let record = entry.snapshot();
        if let Err(e) = self.persistence.save_now(&record).await {
            warn!(key = %entry.key, error = %e, "Failed record not persisted yet");
        }

        error!(key = %entry.key, %detail, "CRITICAL: every breakeven layer failed");
        self.bus.send(DaemonEvent::ProtectionFailed {
            key: entry.key.clone(),
            status: ProtectionStatus::Unprotected,
            detail: detail.clone(),
        });
        self.alerts.dispatch(
            &record.alert_target,
            AlertTemplate::CriticalProtectionFailure,
            json!({
                "key": entry.key.to_string(),
                "detail": detail,
                "remaining_size": record.remaining_size.to_string(),
            }),
        );
        DaemonError::CriticalProtectionFailure {
            key: entry.key.to_string(),
            detail,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertGateway;
    use crate::config::Config;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use sentinel_domain::{Account, MonitorKey, Phase, PositionMonitor};
    use sentinel_exec::{Injected, StubExchange};
    use sentinel_store::{MemoryStore, MonitorRepository};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    fn price(v: Decimal) -> Price {
        Price::new(v).unwrap()
    }

    fn qty(v: Decimal) -> Quantity {
        Quantity::new(v).unwrap()
    }

    struct Fixture {
        stub: Arc<StubExchange>,
        cascade: BreakevenCascade,
        entry: MonitorEntry,
        alerts: Arc<MemoryAlertGateway>,
        store: Arc<MemoryStore>,
    }

    /// Long @ 100 after TP1: 15 remaining, stop at 99 for 15.
    async fn fixture(side: Side) -> Fixture {
        let stub = Arc::new(StubExchange::new(dec!(101)));
        stub.set_position(&btc(), side, dec!(15), dec!(100));
        let stop = if side == Side::Long { dec!(99) } else { dec!(101) };
        let sl_id = stub
            .place_order(&OrderRequest::stop_loss(&btc(), side, price(stop), qty(dec!(15))))
            .await
            .unwrap();

        let key = MonitorKey::new(btc(), side, Account::Primary);
        let mut record = PositionMonitor::new(&key, price(dec!(100)), qty(dec!(15)), "ops").with_stop(SlOrder {
            order_id: sl_id,
            trigger_price: price(stop),
            quantity: qty(dec!(15)),
            covers_full_position: true,
            live: true,
        });
        record.advance_phase(Phase::ProfitTaking, Utc::now()).unwrap();

        let config = Config::test();
        let alerts = Arc::new(MemoryAlertGateway::new());
        let store = Arc::new(MemoryStore::new());
        let cascade = BreakevenCascade::new(
            ExchangeRouter::new(stub.clone()),
            Arc::new(ConcurrencyGuard::new()),
            Arc::new(EventBus::new(16)),
            AlertDispatcher::new(alerts.clone()),
            Arc::new(PersistenceWriter::new(store.clone(), Duration::from_secs(60))),
            config.retry,
            config.protection,
            config.instruments,
        );
        Fixture {
            stub,
            cascade,
            entry: MonitorEntry::new(record, CancellationToken::new()),
            alerts,
            store,
        }
    }

    fn successes(entry: &MonitorEntry) -> usize {
        entry.snapshot().breakeven_successes()
    }

    #[tokio::test]
    async fn test_amend_succeeds_first() {
        let f = fixture(Side::Long).await;

        let outcome = f.cascade.apply(&f.entry).await.unwrap();

        assert_eq!(
            outcome,
            BreakevenOutcome::Applied { method: BreakevenMethod::Amend, price: price(dec!(100.08)) }
        );
        let stops = f.stub.live_stops(&btc());
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].trigger_price.unwrap().as_decimal(), dec!(100.08));
        let record = f.entry.snapshot();
        assert!(record.sl_moved_to_breakeven);
        assert_eq!(record.protection.status, ProtectionStatus::Protected);
        assert_eq!(record.breakeven_log.len(), 1);
        assert!(f.store.contains(&f.entry.key));
        assert!(f.alerts.wait_for(AlertTemplate::BreakevenApplied, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_short_breakeven_is_below_entry() {
        let f = fixture(Side::Short).await;

        let outcome = f.cascade.apply(&f.entry).await.unwrap();

        assert_eq!(
            outcome,
            BreakevenOutcome::Applied { method: BreakevenMethod::Amend, price: price(dec!(99.92)) }
        );
    }

    #[tokio::test]
    async fn test_second_call_is_a_no_op() {
        let f = fixture(Side::Long).await;
        f.cascade.apply(&f.entry).await.unwrap();
        let calls = f.stub.calls();

        let again = f.cascade.apply(&f.entry).await.unwrap();

        assert_eq!(again, BreakevenOutcome::AlreadyAtBreakeven);
        assert_eq!(f.stub.calls().amends, calls.amends);
        assert_eq!(f.stub.calls().places, calls.places);
        assert_eq!(successes(&f.entry), 1);
    }

    #[tokio::test]
    async fn test_directional_guard_rejects_worse_price() {
        let f = fixture(Side::Long).await;
        // Stop already above breakeven
        f.entry.update(|m| m.sl_order.as_mut().unwrap().trigger_price = price(dec!(100.5)));

        let outcome = f.cascade.apply(&f.entry).await.unwrap();

        assert_eq!(outcome, BreakevenOutcome::AlreadyAtBreakeven);
        assert_eq!(f.stub.calls().amends, 0);
        assert!(f.entry.snapshot().breakeven_log.is_empty());
    }

    #[tokio::test]
    async fn test_amend_failure_falls_through_to_cancel_replace() {
        let f = fixture(Side::Long).await;
        f.stub.script_amends([Injected::Reject]);

        let outcome = f.cascade.apply(&f.entry).await.unwrap();

        assert!(matches!(outcome, BreakevenOutcome::Applied { method: BreakevenMethod::CancelReplace, .. }));
        let log = f.entry.snapshot().breakeven_log;
        assert_eq!(log.len(), 2);
        assert!(!log[0].success);
        assert!(log[1].success);
        assert_eq!(f.stub.live_stops(&btc()).len(), 1);
    }

    #[tokio::test]
    async fn test_layer_two_rollback_then_progressive() {
        let f = fixture(Side::Long).await;
        f.stub.script_amends([Injected::Reject]);
        // Cancel/replace placement lands at the wrong trigger
        f.stub.script_places([Injected::SkewTrigger(dec!(0.5))]);

        let outcome = f.cascade.apply(&f.entry).await.unwrap();

        assert!(matches!(outcome, BreakevenOutcome::Applied { method: BreakevenMethod::ProgressiveRetry, .. }));
        let placed = f.stub.placed_requests();
        // [0] fixture stop, [1] skewed replacement, [2] rollback, [3] progressive
        assert_eq!(placed[2].kind, sentinel_exec::OrderKind::StopMarket { trigger_price: price(dec!(99)) });
        assert_eq!(placed[2].quantity, qty(dec!(15)));
        assert!(f.stub.stop_observations(&btc()).iter().all(|n| *n >= 1));
        assert_eq!(f.stub.live_stops(&btc()).len(), 1);
        assert_eq!(successes(&f.entry), 1);
    }

    #[tokio::test]
    async fn test_emergency_layer_marks_emergency_mode() {
        let f = fixture(Side::Long).await;
        f.stub.script_amends([Injected::Reject]);
        // Cancel/replace, its rollback, then every progressive offset rejected
        f.stub.script_places([
            Injected::Reject,
            Injected::Pass,
            Injected::Reject,
            Injected::Reject,
            Injected::Reject,
            Injected::Reject,
        ]);

        let outcome = f.cascade.apply(&f.entry).await.unwrap();

        // 101 × (1 − 0.005)
        assert_eq!(
            outcome,
            BreakevenOutcome::Applied { method: BreakevenMethod::EmergencyManual, price: price(dec!(100.50)) }
        );
        let record = f.entry.snapshot();
        assert_eq!(record.protection.status, ProtectionStatus::EmergencyMode);
        assert!(!record.sl_moved_to_breakeven);
        assert_eq!(record.breakeven_log.len(), 4);
        assert_eq!(f.stub.live_stops(&btc()).len(), 1);
        assert!(f.alerts.wait_for(AlertTemplate::EmergencyProtection, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_retry_after_emergency_restores_protected() {
        let f = fixture(Side::Long).await;
        f.stub.script_amends([Injected::Reject]);
        f.stub.script_places([
            Injected::Reject,
            Injected::Pass,
            Injected::Reject,
            Injected::Reject,
            Injected::Reject,
            Injected::Reject,
        ]);
        f.cascade.apply(&f.entry).await.unwrap();
        let emergency_stop = f.entry.snapshot().sl_order.unwrap();
        let calls = f.stub.calls();

        // Emergency stop at 100.50 already sits beyond breakeven at 100.08
        let retry = f.cascade.apply(&f.entry).await.unwrap();

        assert_eq!(retry, BreakevenOutcome::AlreadyAtBreakeven);
        let record = f.entry.snapshot();
        assert!(record.sl_moved_to_breakeven);
        assert_eq!(record.protection.status, ProtectionStatus::Protected);
        assert!(!record.protection.status.needs_recovery());
        assert_eq!(record.protection.sl_order_id, Some(emergency_stop.order_id));
        assert_eq!(record.protection.sl_price, Some(price(dec!(100.50))));
        assert_eq!(f.stub.calls().places, calls.places);

        let stored = f.store.load_all().await.unwrap();
        assert_eq!(stored[&f.entry.key].protection.status, ProtectionStatus::Protected);

        assert_eq!(f.cascade.apply(&f.entry).await.unwrap(), BreakevenOutcome::AlreadyAtBreakeven);
        assert_eq!(f.entry.snapshot().protection.status, ProtectionStatus::Protected);
    }

    #[tokio::test]
    async fn test_unverified_stop_marks_verification_failed() {
        let f = fixture(Side::Long).await;
        let sl = f.entry.snapshot().sl_order.unwrap();
        let target = Target {
            exchange: f.stub.as_ref(),
            symbol: &f.entry.key.symbol,
            side: Side::Long,
            quantity: qty(dec!(15)),
        };

        // The live stop rests at 99, not at the price being verified
        let result = f.cascade.verify(&f.entry, &target, &sl.order_id, price(dec!(100.08))).await;

        assert!(result.is_err());
        let status = f.entry.snapshot().protection.status;
        assert_eq!(status, ProtectionStatus::VerificationFailed);
        assert!(status.needs_recovery());
    }

    #[tokio::test]
    async fn test_all_layers_exhausted_is_critical() {
        let f = fixture(Side::Long).await;
        f.stub.script_amends([Injected::Reject]);
        f.stub.script_places([
            Injected::Reject, // cancel/replace
            Injected::Reject, // rollback
            Injected::Reject,
            Injected::Reject,
            Injected::Reject,
            Injected::Reject,
            Injected::Reject, // emergency
        ]);

        let result = f.cascade.apply(&f.entry).await;

        assert!(matches!(result, Err(DaemonError::CriticalProtectionFailure { .. })));
        let record = f.entry.snapshot();
        assert_eq!(record.protection.status, ProtectionStatus::Unprotected);
        assert_eq!(record.breakeven_log.len(), 4);
        assert_eq!(record.breakeven_successes(), 0);
        assert!(f.alerts.wait_for(AlertTemplate::CriticalProtectionFailure, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_busy_when_lock_held() {
        let f = fixture(Side::Long).await;
        let _held = f.cascade.guard.lock_breakeven(&f.entry.key).await;

        assert_eq!(f.cascade.apply(&f.entry).await.unwrap(), BreakevenOutcome::Busy);
    }
}
