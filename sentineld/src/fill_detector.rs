//! Multi-signal fill confirmation.
//!
//! An order that disappears from the open list has been filled, cancelled,
//! or is lagging in the snapshot. It is never assumed filled on absence
//! alone. Each independent signal adds a configured weight:
//!
//! | Signal                                              | Default |
//! |-----------------------------------------------------|---------|
//! | Order history says filled                           | 1.0     |
//! | Size moved by the order's quantity (within a lot)   | 0.5     |
//! | Realized PnL moved since the last check             | 0.5     |
//!
//! An order is confirmed once the score reaches the threshold (1.0), so the
//! direct signal alone suffices, and otherwise two corroborating signals are
//! needed.
//!
//! A size reduction larger than everything the monitor has resting is
//! discarded as noise. A reduction no vanished order explains falls back to
//! estimating the hit tier from the cumulative reduction against the ladder.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sentinel_domain::{
    InstrumentRules, PositionMonitor, Quantity, TpLadder, TpStatus,
};
use sentinel_exec::{ExchangePort, ExecResult, OrderStatus};

use crate::cache::AccountSnapshot;
use crate::config::FillConfig;

// =============================================================================
// Types
// =============================================================================

/// What an order does for the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    /// Take-profit rung, 1-based
    TakeProfit(u8),
    StopLoss,
    EntryLeg,
}

impl OrderRole {
    fn reduces(&self) -> bool {
        !matches!(self, OrderRole::EntryLeg)
    }
}

impl std::fmt::Display for OrderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderRole::TakeProfit(n) => write!(f, "TP{}", n),
            OrderRole::StopLoss => write!(f, "SL"),
            OrderRole::EntryLeg => write!(f, "ENTRY"),
        }
    }
}

/// Independent evidence that an order filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSignal {
    Direct,
    SizeDelta,
    RealizedPnl,
}

/// A fill that reached the confidence threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedFill {
    pub order_id: String,
    pub role: OrderRole,
    pub quantity: Quantity,
    pub confidence: Decimal,
    pub signals: Vec<FillSignal>,
}

/// An order that vanished without enough evidence of a fill.
#[derive(Debug, Clone, PartialEq)]
pub struct UnconfirmedFill {
    pub order_id: String,
    pub role: OrderRole,
    pub confidence: Decimal,
}

/// Outcome of one detection pass.
#[derive(Debug, Clone, Default)]
pub struct FillReport {
    pub confirmed: Vec<ConfirmedFill>,
    /// Vanished and reported cancelled or rejected by the exchange
    pub cancelled: Vec<(String, OrderRole)>,
    pub unconfirmed: Vec<UnconfirmedFill>,
    /// The size reading was discarded
    pub noise: bool,
    /// Tiers hit according to the cumulative-reduction fallback
    pub estimated_tier: Option<usize>,
    /// Size held according to the snapshot
    pub observed_size: Quantity,
    /// Cumulative realized PnL according to the snapshot
    pub realized_pnl: Decimal,
}

impl FillReport {
    /// Whether the take-profit rung `n` was confirmed this pass
    pub fn tp_filled(&self, n: u8) -> bool {
        self.confirmed.iter().any(|f| f.role == OrderRole::TakeProfit(n))
    }

    /// Whether the stop was confirmed this pass
    pub fn sl_filled(&self) -> bool {
        self.confirmed.iter().any(|f| f.role == OrderRole::StopLoss)
    }
}

struct Candidate {
    order_id: String,
    role: OrderRole,
    quantity: Quantity,
}

// =============================================================================
// Detector
// =============================================================================

/// Scores vanished orders against the snapshot and order history.
#[derive(Debug, Clone)]
pub struct FillDetector {
    config: FillConfig,
    ladder: TpLadder,
}

impl FillDetector {
    pub fn new(config: FillConfig, ladder: TpLadder) -> Self {
        Self { config, ladder }
    }

    /// Run one detection pass for `record`.
    ///
    /// Reads the order history of every vanished order; read errors
    /// propagate so the tick can be retried.
    pub async fn detect(
        &self,
        record: &PositionMonitor,
        snapshot: &AccountSnapshot,
        exchange: &dyn ExchangePort,
        rules: &InstrumentRules,
    ) -> ExecResult<FillReport> {
        let position = snapshot.position(&record.symbol, record.side);
        let observed_size = position.map(|p| p.size).unwrap_or_else(Quantity::zero);
        let realized_pnl = position
            .map(|p| p.realized_pnl)
            .unwrap_or(record.last_realized_pnl);
        let pnl_delta = realized_pnl - record.last_realized_pnl;

        let remaining = record.remaining_size.as_decimal();
        let reduction = (remaining - observed_size.as_decimal()).max(Decimal::ZERO);
        let increase = (observed_size.as_decimal() - remaining).max(Decimal::ZERO);
        let tolerance = rules.qty_step * self.config.size_tolerance_steps;

        let mut report = FillReport {
            observed_size,
            realized_pnl,
            ..FillReport::default()
        };

        let candidates = self.vanished(record, snapshot);
        let reduce_sum: Decimal = candidates
            .iter()
            .filter(|c| c.role.reduces())
            .map(|c| self.expected_reduction(c, record))
            .sum();

        // Only take-profits and a vanished stop can shrink the position; a
        // resting stop covers the whole size and explains nothing.
        let vanished_stop: Decimal = candidates
            .iter()
            .filter(|c| c.role == OrderRole::StopLoss)
            .map(|c| self.expected_reduction(c, record))
            .sum();
        let explainable = record.live_tp_quantity().as_decimal() + vanished_stop;
        if reduction > explainable + tolerance {
            warn!(
                key = %record.key(),
                %reduction,
                %explainable,
                "Size reduction exceeds what vanished exit orders explain, discarding as noise"
            );
            report.noise = true;
        }

        let increase_sum: Decimal = candidates
            .iter()
            .filter(|c| !c.role.reduces())
            .map(|c| c.quantity.as_decimal())
            .sum();

        for candidate in candidates {
            let history = exchange
                .get_order_history(&record.symbol, Some(&candidate.order_id))
                .await?;
            let status = history
                .iter()
                .find(|o| o.order_id == candidate.order_id)
                .map(|o| o.status);

            if matches!(status, Some(OrderStatus::Cancelled) | Some(OrderStatus::Rejected)) {
                debug!(order_id = %candidate.order_id, role = %candidate.role, "Vanished order was cancelled");
                report.cancelled.push((candidate.order_id, candidate.role));
                continue;
            }

            let mut signals = Vec::new();
            if status == Some(OrderStatus::Filled) {
                signals.push(FillSignal::Direct);
            }
            if !report.noise {
                let size_match = if candidate.role.reduces() {
                    let expected = self.expected_reduction(&candidate, record);
                    reduction > Decimal::ZERO
                        && ((reduction - expected).abs() <= tolerance
                            || (reduction - reduce_sum).abs() <= tolerance)
                } else {
                    let expected = candidate.quantity.as_decimal();
                    increase > Decimal::ZERO
                        && ((increase - expected).abs() <= tolerance
                            || (increase - increase_sum).abs() <= tolerance)
                };
                if size_match {
                    signals.push(FillSignal::SizeDelta);
                }
            }
            let pnl_match = match candidate.role {
                OrderRole::TakeProfit(_) => pnl_delta > Decimal::ZERO,
                OrderRole::StopLoss => !pnl_delta.is_zero(),
                OrderRole::EntryLeg => false,
            };
            if pnl_match {
                signals.push(FillSignal::RealizedPnl);
            }

            let confidence = self.score(&signals);
            if confidence >= self.config.threshold {
                debug!(
                    order_id = %candidate.order_id,
                    role = %candidate.role,
                    %confidence,
                    "Fill confirmed"
                );
                report.confirmed.push(ConfirmedFill {
                    order_id: candidate.order_id,
                    role: candidate.role,
                    quantity: candidate.quantity,
                    confidence,
                    signals,
                });
            } else {
                debug!(
                    order_id = %candidate.order_id,
                    role = %candidate.role,
                    %confidence,
                    "Order vanished without enough fill evidence"
                );
                report.unconfirmed.push(UnconfirmedFill {
                    order_id: candidate.order_id,
                    role: candidate.role,
                    confidence,
                });
            }
        }

        let explained = report.confirmed.iter().any(|f| f.role.reduces());
        if !report.noise && !explained && reduction > tolerance {
            report.estimated_tier = self.estimate_tier(record, observed_size);
        }

        Ok(report)
    }

    /// Weighted sum of the signals present
    pub fn score(&self, signals: &[FillSignal]) -> Decimal {
        signals
            .iter()
            .map(|s| match s {
                FillSignal::Direct => self.config.direct_weight,
                FillSignal::SizeDelta => self.config.size_weight,
                FillSignal::RealizedPnl => self.config.pnl_weight,
            })
            .sum()
    }

    /// Tier reached according to the cumulative reduction, when it is beyond
    /// what is already recorded as filled.
    fn estimate_tier(&self, record: &PositionMonitor, observed_size: Quantity) -> Option<usize> {
        let filled_tp: Decimal = record
            .tp_orders
            .iter()
            .filter(|t| t.status == TpStatus::Filled)
            .map(|t| t.quantity.as_decimal())
            .sum();
        let base = record.remaining_size.as_decimal() + filled_tp;
        if base.is_zero() {
            return None;
        }
        let reduced_pct = (base - observed_size.as_decimal()) / base * Decimal::ONE_HUNDRED;
        let tier = self.ladder.estimate_tier(reduced_pct, self.config.tier_tolerance_pct);
        let already = record
            .tp_orders
            .iter()
            .filter(|t| t.status == TpStatus::Filled)
            .count();
        (tier > already).then_some(tier)
    }

    fn expected_reduction(&self, candidate: &Candidate, record: &PositionMonitor) -> Decimal {
        match candidate.role {
            // A stop sized for full exposure only closes what is held
            OrderRole::StopLoss => candidate.quantity.min(record.remaining_size).as_decimal(),
            _ => candidate.quantity.as_decimal(),
        }
    }

    fn vanished(&self, record: &PositionMonitor, snapshot: &AccountSnapshot) -> Vec<Candidate> {
        let mut out = Vec::new();
        for tp in record.open_tps() {
            if let Some(id) = &tp.order_id {
                if !snapshot.is_open(id) {
                    out.push(Candidate {
                        order_id: id.clone(),
                        role: OrderRole::TakeProfit(tp.tp_number),
                        quantity: tp.quantity,
                    });
                }
            }
        }
        if let Some(sl) = record.sl_order.as_ref().filter(|sl| sl.live) {
            if !snapshot.is_open(&sl.order_id) {
                out.push(Candidate {
                    order_id: sl.order_id.clone(),
                    role: OrderRole::StopLoss,
                    quantity: sl.quantity,
                });
            }
        }
        for leg in record.open_entry_legs() {
            if !snapshot.is_open(&leg.order_id) {
                out.push(Candidate {
                    order_id: leg.order_id.clone(),
                    role: OrderRole::EntryLeg,
                    quantity: leg.quantity,
                });
            }
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sentinel_domain::{Account, MonitorKey, Price, Side, SlOrder, Symbol, TpOrder};
    use sentinel_exec::{ExchangePort, OrderRequest, StubExchange};

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    fn qty(v: Decimal) -> Quantity {
        Quantity::new(v).unwrap()
    }

    fn price(v: Decimal) -> Price {
        Price::new(v).unwrap()
    }

    fn detector() -> FillDetector {
        let config = Config::test();
        FillDetector::new(config.fills, config.ladder)
    }

    /// Long 100 @ 100 with a live SL and TP1 for 85, all resting on the stub.
    async fn setup() -> (StubExchange, PositionMonitor, String, String) {
        let stub = StubExchange::new(dec!(100));
        stub.set_position(&btc(), Side::Long, dec!(100), dec!(100));
        let sl_id = stub
            .place_order(&OrderRequest::stop_loss(&btc(), Side::Long, price(dec!(99)), qty(dec!(100))))
            .await
            .unwrap();
        let tp_id = stub
            .place_order(&OrderRequest::take_profit(&btc(), Side::Long, price(dec!(102)), qty(dec!(85))))
            .await
            .unwrap();

        let key = MonitorKey::new(btc(), Side::Long, Account::Primary);
        let mut record = PositionMonitor::new(&key, price(dec!(100)), qty(dec!(100)), "ops").with_stop(SlOrder {
            order_id: sl_id.clone(),
            trigger_price: price(dec!(99)),
            quantity: qty(dec!(100)),
            covers_full_position: true,
            live: true,
        });
        record.tp_orders.push(TpOrder {
            order_id: Some(tp_id.clone()),
            tp_number: 1,
            price: price(dec!(102)),
            quantity: qty(dec!(85)),
            percentage: dec!(85),
            status: TpStatus::Open,
            filled_at: None,
        });
        (stub, record, sl_id, tp_id)
    }

    async fn snapshot(stub: &StubExchange) -> AccountSnapshot {
        AccountSnapshot {
            account: Account::Primary,
            positions: stub.get_positions(None).await.unwrap(),
            open_orders: stub.get_open_orders(None).await.unwrap(),
            fetched_at: Utc::now(),
            sequence: 1,
        }
    }

    #[tokio::test]
    async fn test_direct_fill_is_confirmed() {
        let (stub, record, _, tp_id) = setup().await;
        stub.fill_order(&tp_id);

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert!(report.tp_filled(1));
        let fill = &report.confirmed[0];
        assert_eq!(fill.signals, vec![FillSignal::Direct, FillSignal::SizeDelta, FillSignal::RealizedPnl]);
        assert_eq!(report.observed_size.as_decimal(), dec!(15));
        assert_eq!(report.realized_pnl, dec!(170));
    }

    #[tokio::test]
    async fn test_size_delta_alone_is_not_enough() {
        let (stub, record, _, tp_id) = setup().await;
        // Order vanishes, size drops, but no history and no PnL
        stub.drop_order_silently(&tp_id);
        stub.set_position_size(&btc(), Side::Long, dec!(15));

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert!(report.confirmed.is_empty());
        assert_eq!(report.unconfirmed[0].confidence, dec!(0.5));
    }

    #[tokio::test]
    async fn test_two_partial_signals_confirm() {
        let (stub, record, _, tp_id) = setup().await;
        stub.drop_order_silently(&tp_id);
        stub.set_position_size(&btc(), Side::Long, dec!(15));
        stub.add_realized_pnl(&btc(), Side::Long, dec!(170));

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert!(report.tp_filled(1));
        assert_eq!(report.confirmed[0].confidence, dec!(1.0));
    }

    #[tokio::test]
    async fn test_cancelled_order_is_not_a_fill() {
        let (stub, record, _, tp_id) = setup().await;
        stub.cancel_order(&btc(), &tp_id).await.unwrap();

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert!(report.confirmed.is_empty());
        assert_eq!(report.cancelled, vec![(tp_id, OrderRole::TakeProfit(1))]);
    }

    #[tokio::test]
    async fn test_oversized_reduction_is_noise() {
        let (stub, record, _, _) = setup().await;
        // Stop still covers all 100 and the only take-profit holds 85, yet 95 disappeared
        stub.set_position_size(&btc(), Side::Long, dec!(5));

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert!(report.noise);
        assert!(report.estimated_tier.is_none());
    }

    #[tokio::test]
    async fn test_unexplained_reduction_estimates_tier() {
        let (stub, record, _, _) = setup().await;
        // Size drops by the take-profit quantity while every tracked order is still resting
        stub.set_position_size(&btc(), Side::Long, dec!(15));

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert!(!report.noise);
        assert!(report.confirmed.is_empty());
        assert_eq!(report.estimated_tier, Some(1));
    }

    #[tokio::test]
    async fn test_stop_fill_closes_position() {
        let (stub, record, sl_id, _) = setup().await;
        stub.fill_order(&sl_id);

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert!(report.sl_filled());
        assert!(report.confirmed[0].signals.contains(&FillSignal::SizeDelta));
        assert_eq!(report.observed_size, Quantity::zero());
    }

    #[tokio::test]
    async fn test_entry_leg_fill_needs_history() {
        let (stub, mut record, _, _) = setup().await;
        let leg_id = stub
            .place_order(&OrderRequest::entry_limit(&btc(), Side::Long, price(dec!(98)), qty(dec!(50))))
            .await
            .unwrap();
        record.entry_legs.push(sentinel_domain::EntryLeg {
            order_id: leg_id.clone(),
            price: price(dec!(98)),
            quantity: qty(dec!(50)),
            status: sentinel_domain::EntryLegStatus::Open,
        });
        stub.fill_order(&leg_id);

        let report = detector()
            .detect(&record, &snapshot(&stub).await, &stub, &InstrumentRules::default())
            .await
            .unwrap();

        assert_eq!(report.confirmed[0].role, OrderRole::EntryLeg);
        assert_eq!(report.observed_size.as_decimal(), dec!(150));
    }
}
