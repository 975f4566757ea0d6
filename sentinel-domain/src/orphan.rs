//! Safety Net: orphaned exchange positions
//!
//! A position that is live on the exchange but has no local monitor (opened
//! while the daemon was down, or its record was lost). Adoption rebuilds a
//! monitor from the orders found resting for it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::{
    EntryLeg, EntryLegStatus, MonitorKey, Phase, PositionMonitor, SlOrder, TpOrder, TpStatus,
};
use crate::instrument::TpLadder;
use crate::value_objects::{OrderSide, Price, Quantity};

// =============================================================================
// Observed orders
// =============================================================================

/// Order type as seen on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedKind {
    /// Conditional market order
    Stop { trigger_price: Price },
    /// Resting limit order
    Limit { price: Price },
}

/// Exchange-agnostic view of a resting order.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub kind: ObservedKind,
    pub quantity: Quantity,
    pub reduce_only: bool,
}

// =============================================================================
// Orphan Position
// =============================================================================

/// A live exchange position with no monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanPosition {
    pub key: MonitorKey,
    pub entry_price: Price,
    pub size: Quantity,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of adopting an orphan
#[derive(Debug, Clone)]
pub struct Adoption {
    /// Rebuilt record
    pub monitor: PositionMonitor,
    /// No protective stop was found; one must be placed
    pub needs_safety_stop: bool,
    /// Entry legs that should no longer rest (adopted past TP1)
    pub stale_entry_legs: Vec<String>,
}

impl OrphanPosition {
    /// Create an orphan record
    pub fn new(key: MonitorKey, entry_price: Price, size: Quantity) -> Self {
        Self {
            key,
            entry_price,
            size,
            detected_at: Utc::now(),
        }
    }

    /// Rebuild a monitor from the orders resting for this position.
    ///
    /// Reduce-only stops on the exit side become the SL (the most protective
    /// one wins). Reduce-only limits on the exit side become the TP ladder,
    /// ranked nearest-to-entry first. Non-reduce-only limits on the entry
    /// side become entry legs.
    ///
    /// Fewer TPs than the ladder has rungs means some already fired: the
    /// monitor is adopted in `ProfitTaking` with TP1 marked as hit.
    pub fn adopt(&self, orders: &[ObservedOrder], ladder: &TpLadder, alert_target: &str) -> Adoption {
        let side = self.key.side;
        let exit = side.exit_action();
        let entry = side.entry_action();

        let stop = orders
            .iter()
            .filter(|o| o.reduce_only && o.side == exit)
            .filter_map(|o| match o.kind {
                ObservedKind::Stop { trigger_price } => Some((o, trigger_price)),
                ObservedKind::Limit { .. } => None,
            })
            .reduce(|best, cand| if side.improves_stop(cand.1, best.1) { cand } else { best });

        let mut tps: Vec<(&ObservedOrder, Price)> = orders
            .iter()
            .filter(|o| o.reduce_only && o.side == exit)
            .filter_map(|o| match o.kind {
                ObservedKind::Limit { price } => Some((o, price)),
                ObservedKind::Stop { .. } => None,
            })
            .collect();
        tps.sort_by_key(|(_, price)| (price.as_decimal() - self.entry_price.as_decimal()).abs());

        let legs: Vec<EntryLeg> = orders
            .iter()
            .filter(|o| !o.reduce_only && o.side == entry)
            .filter_map(|o| match o.kind {
                ObservedKind::Limit { price } => Some(EntryLeg {
                    order_id: o.order_id.clone(),
                    price,
                    quantity: o.quantity,
                    status: EntryLegStatus::Open,
                }),
                ObservedKind::Stop { .. } => None,
            })
            .collect();

        let past_tp1 = !tps.is_empty() && tps.len() < ladder.len();

        let mut monitor = PositionMonitor::new(&self.key, self.entry_price, self.size, alert_target);
        monitor.created_at = self.detected_at;

        let size = self.size.as_decimal();
        monitor.tp_orders = tps
            .iter()
            .enumerate()
            .map(|(i, (o, price))| TpOrder {
                order_id: Some(o.order_id.clone()),
                tp_number: (i + 1) as u8,
                price: *price,
                quantity: o.quantity,
                percentage: if size.is_zero() {
                    Decimal::ZERO
                } else {
                    o.quantity.as_decimal() / size * Decimal::ONE_HUNDRED
                },
                status: TpStatus::Open,
                filled_at: None,
            })
            .collect();

        let mut stale_entry_legs = Vec::new();
        if past_tp1 {
            // Building -> ProfitTaking is always a forward step on a fresh record
            let _ = monitor.advance_phase(Phase::ProfitTaking, self.detected_at);
            stale_entry_legs = legs.iter().map(|l| l.order_id.clone()).collect();
        } else {
            monitor = monitor.with_entry_legs(legs);
        }

        let needs_safety_stop = stop.is_none();
        if let Some((o, trigger_price)) = stop {
            let covers_full_position = o.quantity >= monitor.tracked_exposure();
            monitor = monitor.with_stop(SlOrder {
                order_id: o.order_id.clone(),
                trigger_price,
                quantity: o.quantity,
                covers_full_position,
                live: true,
            });
        }

        Adoption {
            monitor,
            needs_safety_stop,
            stale_entry_legs,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
