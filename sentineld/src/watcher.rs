//! Per-position watcher task.
//!
//! One task per monitor, sleeping an adaptive interval between ticks. A tick:
//!
//! 1. reads the account snapshot from the shared cache
//! 2. confirms closure after two zero-size readings from distinct refreshes
//! 3. detects fills and applies them to the record
//! 4. advances to PROFIT_TAKING on TP1 and retries stale entry-leg cancels
//! 5. rebalances the TP ladder when the size changed
//! 6. runs the breakeven cascade (with a cooldown while protection is degraded)
//!    and brings the mirror monitor along
//! 7. re-sizes or re-places the stop if it no longer covers the exposure
//!
//! While the circuit breaker is open only steps 1 and 2 run. Cancelling the
//! entry token outside daemon shutdown tears the monitor down: its orders are
//! cancelled and its record removed. On daemon shutdown orders and records
//! are kept.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sentinel_domain::{
    Account, EntryLegStatus, InstrumentRules, Phase, PhaseChange, PositionMonitor, ProtectionStatus,
    TpStatus,
};
use sentinel_exec::{ExchangePort, ExchangePosition};

use crate::alerts::AlertTemplate;
use crate::breakeven::BreakevenOutcome;
use crate::cache::AccountSnapshot;
use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::DaemonEvent;
use crate::fill_detector::{FillReport, OrderRole};
use crate::polling::{classify_urgency, interval_for, Urgency};
use crate::registry::{MonitorEntry, MonitorRegistry};
use crate::services::Services;

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep watching; sleep for the tier's interval
    Continue(Urgency),
    /// The position closed and the monitor was removed
    Closed,
}

/// What applying a fill report changed
#[derive(Debug, Default)]
struct AppliedFills {
    size_changed: bool,
    any_confirmed: bool,
}

pub struct PositionWatcher {
    registry: Arc<MonitorRegistry>,
    services: Arc<Services>,
    entry: Arc<MonitorEntry>,
    breaker: CircuitBreaker,
    last_protection_attempt: Option<Instant>,
    source: String,
}

impl PositionWatcher {
    pub fn new(registry: Arc<MonitorRegistry>, entry: Arc<MonitorEntry>) -> Self {
        let services = Arc::clone(registry.services());
        Self {
            breaker: CircuitBreaker::new(&services.config.breaker),
            source: format!("watcher:{}", entry.key),
            registry,
            services,
            entry,
            last_protection_attempt: None,
        }
    }

    /// Poll until the position closes or the entry is cancelled.
    pub async fn run(mut self) {
        let key = self.entry.key.clone();
        let cancel = self.entry.cancel_token();
        info!(%key, "Watcher started");

        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            wait = match self.tick().await {
                Ok(TickOutcome::Closed) => {
                    info!(%key, "Watcher finished, position closed");
                    return;
                }
                Ok(TickOutcome::Continue(urgency)) => {
                    debug!(%key, ?urgency, "Tick complete");
                    interval_for(urgency, &self.services.config.polling)
                }
                Err(e) => {
                    if self.breaker.record_failure() {
                        error!(
                            %key,
                            error = %e,
                            cooldown_ms = self.breaker.remaining_cooldown().as_millis() as u64,
                            "Circuit breaker opened"
                        );
                    } else {
                        warn!(%key, error = %e, state = ?self.breaker.state(), "Tick failed");
                    }
                    interval_for(Urgency::Standard, &self.services.config.polling)
                }
            };
        }

        if self.registry.shutdown_token().is_cancelled() {
            self.services.persistence.mark_dirty(&self.entry.snapshot());
            info!(%key, "Watcher stopped for shutdown");
        } else {
            self.teardown().await;
        }
    }

    /// One pass over the position.
    pub async fn tick(&mut self) -> DaemonResult<TickOutcome> {
        let services = Arc::clone(&self.services);
        let key = self.entry.key.clone();
        let full = self.breaker.allow();

        let snapshot = services.cache.snapshot(key.account).await?;
        let exchange = services.router.for_account(key.account)?;
        let rules = services.config.instruments.rules_for(&key.symbol);
        let position = snapshot.position(&key.symbol, key.side).filter(|p| !p.size.is_zero()).cloned();

        let Some(position) = position else {
            return self.on_zero_size(&snapshot, exchange.as_ref(), &rules).await;
        };
        if self.entry.snapshot().zero_size_seq.is_some() {
            info!(%key, size = %position.size, "Zero-size reading not confirmed, position still open");
            self.entry.update(|m| m.zero_size_seq = None);
        }

        if !full {
            debug!(
                %key,
                remaining_ms = self.breaker.remaining_cooldown().as_millis() as u64,
                "Breaker open, essential checks only"
            );
            return Ok(TickOutcome::Continue(Urgency::Standard));
        }

        // Fills
        let record = self.entry.snapshot();
        let report = services.fills.detect(&record, &snapshot, exchange.as_ref(), &rules).await?;
        let applied = self.apply_fills(&report, Some(&position));
        if applied.any_confirmed {
            services.cache.begin_active_window(key.account).await;
            if let Err(e) = services.persistence.save_now(&self.entry.snapshot()).await {
                warn!(%key, error = %e, "Fill not persisted yet");
            }
        }

        // Phase
        let mut phase_changed = false;
        let record = self.entry.snapshot();
        let tp1_filled = record
            .tp_orders
            .iter()
            .any(|t| t.tp_number == 1 && t.status == TpStatus::Filled);
        if tp1_filled && record.phase == Phase::Building {
            if let PhaseChange::Advanced { .. } = services.phases.transition(&self.entry, Phase::ProfitTaking).await? {
                phase_changed = true;
                if let Err(e) = services.persistence.save_now(&self.entry.snapshot()).await {
                    warn!(%key, error = %e, "Phase change not persisted yet");
                }
            }
        } else if record.phase == Phase::ProfitTaking && record.open_entry_legs().next().is_some() {
            let still_open = services.phases.cancel_entry_legs(&self.entry).await;
            debug!(%key, still_open, "Retried stale entry-leg cancels");
        }

        // Ladder
        let record = self.entry.snapshot();
        let unplaced = record.tp_orders.iter().any(|t| t.status == TpStatus::Unplaced);
        if applied.size_changed || unplaced {
            services.rebalancer.rebalance(&self.entry).await?;
        }

        // Breakeven
        let mut breakeven = None;
        let record = self.entry.snapshot();
        if record.tp1_hit && !record.sl_moved_to_breakeven && self.protection_due(&record) {
            services.cache.begin_active_window(key.account).await;
            self.last_protection_attempt = Some(Instant::now());
            match services.cascade.apply(&self.entry).await {
                Ok(outcome) => breakeven = Some(outcome),
                Err(DaemonError::CriticalProtectionFailure { detail, .. }) => {
                    error!(%key, %detail, "Position unprotected, cascade will be retried after cooldown");
                }
                Err(e) => return Err(e),
            }
        }

        // Mirror
        let propagate = phase_changed
            || matches!(
                breakeven,
                Some(BreakevenOutcome::Applied { .. }) | Some(BreakevenOutcome::AlreadyAtBreakeven)
            );
        if propagate && key.account == Account::Primary && services.config.mirror_enabled {
            if let Err(e) = services.mirror.sync_from_primary(&self.registry, &self.entry.snapshot()).await {
                warn!(%key, error = %e, "Mirror sync failed");
            }
        }

        // Coverage
        let record = self.entry.snapshot();
        let exposure = record.tracked_exposure();
        let stop_matches = record
            .sl_order
            .as_ref()
            .is_some_and(|sl| sl.live && sl.quantity == exposure);
        if !exposure.is_zero() && !stop_matches {
            let under_sized = record
                .sl_order
                .as_ref()
                .is_some_and(|sl| sl.live && sl.quantity < exposure);
            if under_sized && record.protection.status != ProtectionStatus::EmergencyMode {
                self.entry.update(|m| {
                    m.protection.status = ProtectionStatus::PartiallyProtected;
                    m.protection.updated_at = Utc::now();
                });
                warn!(%key, %exposure, "Live stop smaller than exposure, position partially protected");
            }
            let resize = services.rebalancer.resize_stop(&self.entry).await?;
            debug!(%key, ?resize, "Stop coverage check");
        }

        self.entry.update(|m| m.last_check = Utc::now());
        let record = self.entry.snapshot();
        services.persistence.mark_dirty(&record);
        services.activity.record_activity(&self.source);
        if self.breaker.state() == BreakerState::HalfOpen {
            info!(%key, "Half-open tick succeeded, breaker closed");
        }
        self.breaker.record_success();

        Ok(TickOutcome::Continue(classify_urgency(
            &record,
            Some(position.mark_price),
            &services.config.polling,
        )))
    }

    /// Apply confirmed fills, cancellations and the size reading.
    fn apply_fills(&self, report: &FillReport, position: Option<&ExchangePosition>) -> AppliedFills {
        let services = &self.services;
        let key = &self.entry.key;
        let now = Utc::now();
        let mut applied = AppliedFills::default();

        for fill in &report.confirmed {
            applied.any_confirmed = true;
            self.entry.update(|m| match fill.role {
                OrderRole::TakeProfit(n) => {
                    if let Some(tp) = m.tp_orders.iter_mut().find(|t| t.tp_number == n) {
                        tp.status = TpStatus::Filled;
                        tp.filled_at = Some(now);
                    }
                }
                OrderRole::StopLoss => {
                    if let Some(sl) = m.sl_order.as_mut() {
                        sl.live = false;
                    }
                }
                OrderRole::EntryLeg => {
                    if let Some(leg) = m.entry_legs.iter_mut().find(|l| l.order_id == fill.order_id) {
                        leg.status = EntryLegStatus::Filled;
                    }
                    if let Some(position) = position {
                        m.entry_price = position.entry_price;
                    }
                }
            });

            info!(
                %key,
                order_id = %fill.order_id,
                role = %fill.role,
                quantity = %fill.quantity,
                confidence = %fill.confidence,
                "Fill confirmed"
            );
            services.bus.send(DaemonEvent::OrderFilled {
                key: key.clone(),
                order_id: fill.order_id.clone(),
                role: fill.role,
                quantity: fill.quantity,
                confidence: fill.confidence,
            });
            let template = match fill.role {
                OrderRole::TakeProfit(_) => Some(AlertTemplate::TakeProfitFilled),
                OrderRole::StopLoss => Some(AlertTemplate::StopLossFilled),
                OrderRole::EntryLeg => None,
            };
            if let Some(template) = template {
                services.alerts.dispatch(
                    &self.entry.snapshot().alert_target,
                    template,
                    json!({
                        "key": key.to_string(),
                        "order": fill.role.to_string(),
                        "order_id": fill.order_id,
                        "quantity": fill.quantity.to_string(),
                    }),
                );
            }
        }

        for (order_id, role) in &report.cancelled {
            warn!(%key, %order_id, %role, "Order cancelled outside the engine");
            self.entry.update(|m| match role {
                OrderRole::TakeProfit(n) => {
                    if let Some(tp) = m.tp_orders.iter_mut().find(|t| t.tp_number == *n) {
                        tp.status = TpStatus::Unplaced;
                        tp.order_id = None;
                    }
                }
                OrderRole::StopLoss => {
                    if let Some(sl) = m.sl_order.as_mut() {
                        sl.live = false;
                    }
                }
                OrderRole::EntryLeg => {
                    if let Some(leg) = m.entry_legs.iter_mut().find(|l| l.order_id == *order_id) {
                        leg.status = EntryLegStatus::Cancelled;
                    }
                }
            });
        }

        if let Some(tier) = report.estimated_tier {
            let vanished: Vec<&str> = report
                .unconfirmed
                .iter()
                .filter(|u| matches!(u.role, OrderRole::TakeProfit(n) if usize::from(n) <= tier))
                .map(|u| u.order_id.as_str())
                .collect();
            if !vanished.is_empty() {
                warn!(%key, tier, orders = ?vanished, "Fills attributed from cumulative reduction");
                applied.any_confirmed = true;
                self.entry.update(|m| {
                    for tp in m.tp_orders.iter_mut() {
                        if tp.order_id.as_deref().is_some_and(|id| vanished.contains(&id)) {
                            tp.status = TpStatus::Filled;
                            tp.filled_at = Some(now);
                        }
                    }
                });
            }
        }

        if !report.noise {
            let previous = self.entry.update(|m| {
                let previous = m.remaining_size;
                m.remaining_size = report.observed_size;
                m.last_realized_pnl = report.realized_pnl;
                previous
            });
            applied.size_changed = previous != report.observed_size;
            if applied.size_changed {
                info!(%key, from = %previous, to = %report.observed_size, "Position size changed");
            }
        }
        applied
    }

    /// Two-check closure: zero size must be seen in two distinct refreshes.
    async fn on_zero_size(
        &mut self,
        snapshot: &AccountSnapshot,
        exchange: &dyn ExchangePort,
        rules: &InstrumentRules,
    ) -> DaemonResult<TickOutcome> {
        let services = Arc::clone(&self.services);
        let key = self.entry.key.clone();

        match self.entry.snapshot().zero_size_seq {
            None => {
                info!(%key, sequence = snapshot.sequence, "Zero size observed, awaiting confirmation");
                self.entry.update(|m| m.zero_size_seq = Some(snapshot.sequence));
                services.cache.invalidate(key.account).await;
                return Ok(TickOutcome::Continue(Urgency::Imminent));
            }
            Some(seq) if seq == snapshot.sequence => {
                return Ok(TickOutcome::Continue(Urgency::Imminent));
            }
            Some(_) => {}
        }

        info!(%key, "Zero size confirmed, closing monitor");
        let record = self.entry.snapshot();
        match services.fills.detect(&record, snapshot, exchange, rules).await {
            Ok(report) => {
                self.apply_fills(&report, None);
            }
            Err(e) => warn!(%key, error = %e, "Final fill detection failed"),
        }

        let reason = close_reason(&self.entry.snapshot());
        services.phases.transition(&self.entry, Phase::Closed).await?;
        let record = self.entry.snapshot();
        services.alerts.dispatch(
            &record.alert_target,
            AlertTemplate::PositionClosed,
            json!({
                "key": key.to_string(),
                "reason": reason,
                "realized_pnl": record.last_realized_pnl.to_string(),
                "take_profits_filled": record.tp_orders.iter().filter(|t| t.status == TpStatus::Filled).count(),
            }),
        );
        self.registry.remove(&key, reason).await;
        Ok(TickOutcome::Closed)
    }

    fn protection_due(&self, record: &PositionMonitor) -> bool {
        if !record.protection.status.needs_recovery() {
            return true;
        }
        self.last_protection_attempt
            .map_or(true, |at| at.elapsed() >= self.services.config.protection.retry_cooldown)
    }

    /// Cancel what the monitor still owns and drop it from the registry.
    async fn teardown(&self) {
        let key = &self.entry.key;
        let failed = self.services.phases.cancel_all_orders(&self.entry).await;
        if failed > 0 {
            warn!(%key, failed, "Some orders could not be cancelled on teardown");
        }
        self.registry.remove(key, "stopped").await;
        info!(%key, "Watcher stopped, monitor torn down");
    }
}

fn close_reason(record: &PositionMonitor) -> &'static str {
    let sl_filled = record.sl_order.as_ref().is_some_and(|sl| !sl.live);
    let all_tps = !record.tp_orders.is_empty() && record.tp_orders.iter().all(|t| t.status != TpStatus::Open);
    if sl_filled && record.sl_moved_to_breakeven {
        "breakeven_stop"
    } else if sl_filled {
        "stop_loss"
    } else if all_tps {
        "take_profit"
    } else {
        "external"
    }
}
