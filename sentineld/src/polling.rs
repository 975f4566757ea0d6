//! Adaptive poll interval.
//!
//! Pure classification of a monitor into an urgency tier; the watcher sleeps
//! for the tier's interval between ticks.

use std::time::Duration;

use rust_decimal::Decimal;
use sentinel_domain::{PositionMonitor, Price};

use crate::config::PollingConfig;

/// How soon the position needs attention again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// A TP or stop is about to trigger, or protection work is outstanding
    Imminent,
    /// TP1 fired and further TPs are pending
    TpPending,
    Standard,
    /// Only a small remainder of the position is left
    MostlyClosed,
    /// Nothing is resting for the position
    Idle,
}

/// Classify a monitor given the latest mark price.
pub fn classify_urgency(record: &PositionMonitor, mark: Option<Price>, config: &PollingConfig) -> Urgency {
    if record.zero_size_seq.is_some()
        || (record.tp1_hit && !record.sl_moved_to_breakeven)
        || record.protection.status.needs_recovery()
    {
        return Urgency::Imminent;
    }

    if let Some(mark) = mark {
        let near = |price: Price| price.distance_ratio(mark) <= config.proximity;
        let tp_near = record.open_tps().any(|tp| near(tp.price));
        let sl_near = record
            .sl_order
            .as_ref()
            .is_some_and(|sl| sl.live && near(sl.trigger_price));
        if tp_near || sl_near {
            return Urgency::Imminent;
        }
    }

    let ratio = record.remaining_ratio();
    if ratio > Decimal::ZERO && ratio <= config.mostly_closed_ratio {
        return Urgency::MostlyClosed;
    }
    if record.tp1_hit && record.open_tps().next().is_some() {
        return Urgency::TpPending;
    }
    if record.open_tps().next().is_none() && record.open_entry_legs().next().is_none() {
        return Urgency::Idle;
    }
    Urgency::Standard
}

/// Sleep between ticks for an urgency tier.
pub fn interval_for(urgency: Urgency, config: &PollingConfig) -> Duration {
    match urgency {
        Urgency::Imminent => config.imminent,
        Urgency::TpPending => config.tp_pending,
        Urgency::Standard => config.standard,
        Urgency::MostlyClosed => config.mostly_closed,
        Urgency::Idle => config.idle,
    }
}
