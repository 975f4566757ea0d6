//! Instrument trading rules and the take-profit ladder.
//!
//! Exchanges reject quantities off the lot step, prices off the tick and
//! orders below a minimum notional. Everything the engine sends goes through
//! these rules first.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::value_objects::{DomainError, Price, Quantity};

// =============================================================================
// Instrument Rules
// =============================================================================

/// Lot size, tick size and minimum notional for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRules {
    /// Quantity increment
    pub qty_step: Decimal,
    /// Price increment
    pub tick_size: Decimal,
    /// Minimum order value in quote currency
    pub min_notional: Decimal,
}

impl InstrumentRules {
    /// Create validated rules.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidInstrument` if any increment is not positive
    /// or the minimum notional is negative.
    pub fn new(qty_step: Decimal, tick_size: Decimal, min_notional: Decimal) -> Result<Self, DomainError> {
        if qty_step <= Decimal::ZERO || tick_size <= Decimal::ZERO {
            return Err(DomainError::InvalidInstrument(format!(
                "qty_step and tick_size must be positive (got {qty_step}, {tick_size})"
            )));
        }
        if min_notional < Decimal::ZERO {
            return Err(DomainError::InvalidInstrument(format!(
                "min_notional must not be negative (got {min_notional})"
            )));
        }
        Ok(Self { qty_step, tick_size, min_notional })
    }

    /// Snap a quantity down to the lot step. Never rounds up, so a snapped
    /// take-profit can never exceed the size it was derived from.
    pub fn snap_qty(&self, qty: Decimal) -> Quantity {
        let steps = (qty / self.qty_step).floor();
        Quantity::new((steps * self.qty_step).max(Decimal::ZERO)).unwrap_or_else(|_| Quantity::zero())
    }

    /// Snap a price to the nearest tick.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPrice` if the snapped value is not positive.
    pub fn snap_price(&self, price: Decimal) -> Result<Price, DomainError> {
        let ticks = (price / self.tick_size).round();
        Price::new(ticks * self.tick_size)
    }

    /// Whether an order of `qty` at `price` clears the minimum notional.
    pub fn meets_min_notional(&self, qty: Quantity, price: Price) -> bool {
        qty.as_decimal() * price.as_decimal() >= self.min_notional
    }

    /// Whether two quantities are equal within one lot step.
    pub fn same_lot(&self, a: Decimal, b: Decimal) -> bool {
        (a - b).abs() < self.qty_step
    }
}

impl Default for InstrumentRules {
    fn default() -> Self {
        Self {
            qty_step: dec!(0.001),
            tick_size: dec!(0.01),
            min_notional: dec!(5),
        }
    }
}

// =============================================================================
// TP Ladder
// =============================================================================

/// Ordered take-profit percentages. Index 0 is TP1.
///
/// # Invariants
/// - At least one rung
/// - Every rung is positive
/// - Rungs sum to exactly 100
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpLadder(Vec<Decimal>);

impl TpLadder {
    /// Validate and build a ladder.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidLadder` when the invariants above fail.
    pub fn new(percentages: Vec<Decimal>) -> Result<Self, DomainError> {
        if percentages.is_empty() {
            return Err(DomainError::InvalidLadder("ladder has no rungs".into()));
        }
        if let Some(bad) = percentages.iter().find(|p| **p <= Decimal::ZERO) {
            return Err(DomainError::InvalidLadder(format!("rung must be positive, got {bad}")));
        }
        let sum: Decimal = percentages.iter().copied().sum();
        if sum != dec!(100) {
            return Err(DomainError::InvalidLadder(format!("rungs sum to {sum}, expected 100")));
        }
        Ok(Self(percentages))
    }

    /// Rung percentages in TP order
    pub fn percentages(&self) -> &[Decimal] {
        &self.0
    }

    /// Number of rungs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a validated ladder
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cumulative percentage filled once TPs `1..=tp_number` have fired.
    pub fn cumulative(&self, tp_number: usize) -> Decimal {
        self.0.iter().take(tp_number).copied().sum()
    }

    /// Estimate how many tiers have been hit from a cumulative reduction
    /// percentage, allowing `tolerance` percentage points of slippage.
    ///
    /// Returns 0 when not even TP1's share has been reduced.
    pub fn estimate_tier(&self, reduced_pct: Decimal, tolerance: Decimal) -> usize {
        let mut tier = 0;
        for n in 1..=self.0.len() {
            if reduced_pct + tolerance >= self.cumulative(n) {
                tier = n;
            } else {
                break;
            }
        }
        tier
    }
}

impl Default for TpLadder {
    fn default() -> Self {
        Self(vec![dec!(85), dec!(5), dec!(5), dec!(5)])
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_qty_rounds_down() {
        let rules = InstrumentRules::default();
        assert_eq!(rules.snap_qty(dec!(1.23456)).as_decimal(), dec!(1.234));
        assert_eq!(rules.snap_qty(dec!(0.0009)).as_decimal(), dec!(0));
    }

    #[test]
    fn test_snap_price_to_tick() {
        let rules = InstrumentRules::default();
        assert_eq!(rules.snap_price(dec!(100.126)).unwrap().as_decimal(), dec!(100.13));
        assert!(rules.snap_price(dec!(0.001)).is_err());
    }

    #[test]
    fn test_min_notional() {
        let rules = InstrumentRules::default();
        let price = Price::new(dec!(100)).unwrap();
        assert!(rules.meets_min_notional(Quantity::new(dec!(0.05)).unwrap(), price));
        assert!(!rules.meets_min_notional(Quantity::new(dec!(0.04)).unwrap(), price));
    }

    #[test]
    fn test_rules_validation() {
        assert!(InstrumentRules::new(dec!(0), dec!(0.01), dec!(5)).is_err());
        assert!(InstrumentRules::new(dec!(0.1), dec!(0.01), dec!(-1)).is_err());
        assert!(InstrumentRules::new(dec!(0.1), dec!(0.01), dec!(0)).is_ok());
    }

    #[test]
    fn test_ladder_must_sum_to_100() {
        assert!(TpLadder::new(vec![dec!(50), dec!(50)]).is_ok());
        assert!(TpLadder::new(vec![dec!(50), dec!(40)]).is_err());
        assert!(TpLadder::new(vec![]).is_err());
        assert!(TpLadder::new(vec![dec!(110), dec!(-10)]).is_err());
    }

    #[test]
    fn test_estimate_tier() {
        let ladder = TpLadder::default();
        assert_eq!(ladder.estimate_tier(dec!(10), dec!(1)), 0);
        assert_eq!(ladder.estimate_tier(dec!(85), dec!(1)), 1);
        assert_eq!(ladder.estimate_tier(dec!(84.5), dec!(1)), 1);
        assert_eq!(ladder.estimate_tier(dec!(90), dec!(1)), 2);
        assert_eq!(ladder.estimate_tier(dec!(100), dec!(1)), 4);
    }
}
