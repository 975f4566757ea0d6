//! Domain Entities for Sentinel
//!
//! The per-position monitor record and the order records it tracks.
//! The record is the engine's authoritative view of what *should* be live on
//! the exchange; the daemon reconciles it against what *is* live.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::value_objects::{Account, DomainError, Price, Quantity, Side, Symbol};

/// Current persisted schema version of [`PositionMonitor`].
pub const SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Monitor Key
// =============================================================================

/// Identity of a monitor: one per (symbol, side, account).
///
/// String form is `SYMBOL:side:account`, e.g. `BTCUSDT:long:main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorKey {
    pub symbol: Symbol,
    pub side: Side,
    pub account: Account,
}

impl MonitorKey {
    /// Create a key
    pub fn new(symbol: Symbol, side: Side, account: Account) -> Self {
        Self { symbol, side, account }
    }

    /// The same position on the other account
    pub fn counterpart(&self) -> Self {
        Self {
            symbol: self.symbol.clone(),
            side: self.side,
            account: self.account.counterpart(),
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.symbol.as_pair(), self.side.label(), self.account.label())
    }
}

impl FromStr for MonitorKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(symbol), Some(side), Some(account), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(DomainError::InvalidKey(format!("expected SYMBOL:side:account, got {s}")));
        };
        Ok(Self {
            symbol: Symbol::from_pair(symbol)?,
            side: side.parse()?,
            account: account.parse()?,
        })
    }
}

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a monitored position.
///
/// Transitions only move forward: Building → ProfitTaking → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Position still accumulating through entry legs
    Building,
    /// TP1 confirmed, remaining entry legs cancelled
    ProfitTaking,
    /// Terminal
    Closed,
}

impl Phase {
    fn rank(&self) -> u8 {
        match self {
            Phase::Building => 0,
            Phase::ProfitTaking => 1,
            Phase::Closed => 2,
        }
    }

    /// Whether moving to `target` is a forward step
    pub fn can_advance_to(&self, target: Phase) -> bool {
        target.rank() > self.rank()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Building => write!(f, "BUILDING"),
            Phase::ProfitTaking => write!(f, "PROFIT_TAKING"),
            Phase::Closed => write!(f, "CLOSED"),
        }
    }
}

// =============================================================================
// Orders tracked by a monitor
// =============================================================================

/// Take-profit slot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TpStatus {
    /// Live on the exchange
    Open,
    /// Confirmed filled
    Filled,
    /// Removed from the ladder (e.g. below minimum notional)
    Cancelled,
    /// Cancelled for a replace whose placement has not succeeded yet
    Unplaced,
}

/// One rung of the take-profit ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpOrder {
    pub order_id: Option<String>,
    /// Rank in the ladder, 1-based
    pub tp_number: u8,
    pub price: Price,
    pub quantity: Quantity,
    /// Share of current size, in percent
    pub percentage: Decimal,
    pub status: TpStatus,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
}

impl TpOrder {
    /// Live on the exchange with a known order id
    pub fn is_live(&self) -> bool {
        self.status == TpStatus::Open && self.order_id.is_some()
    }

    /// Still part of the ladder (live or awaiting re-placement)
    pub fn is_pending(&self) -> bool {
        matches!(self.status, TpStatus::Open | TpStatus::Unplaced)
    }
}

/// The protective stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlOrder {
    pub order_id: String,
    pub trigger_price: Price,
    pub quantity: Quantity,
    /// True while the stop covers the full intended exposure rather than only
    /// the post-TP1 remainder
    pub covers_full_position: bool,
    /// False once the order was cancelled and its replacement is outstanding
    #[serde(default = "default_true")]
    pub live: bool,
}

fn default_true() -> bool {
    true
}

/// Entry leg status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryLegStatus {
    Open,
    Filled,
    Cancelled,
}

/// An entry limit order that was resting when the monitor was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryLeg {
    pub order_id: String,
    pub price: Price,
    pub quantity: Quantity,
    pub status: EntryLegStatus,
}

// =============================================================================
// Breakeven audit log
// =============================================================================

/// Strategy used by one breakeven attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakevenMethod {
    /// In-place amendment of the existing stop
    Amend,
    /// Cancel then place, with rollback to the original stop
    CancelReplace,
    /// Placement across a ladder of offsets from breakeven
    ProgressiveRetry,
    /// Conservative stop at an offset from the market price
    EmergencyManual,
}

impl fmt::Display for BreakevenMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakevenMethod::Amend => "amend",
            BreakevenMethod::CancelReplace => "cancel_replace",
            BreakevenMethod::ProgressiveRetry => "progressive_retry",
            BreakevenMethod::EmergencyManual => "emergency_manual",
        };
        f.write_str(s)
    }
}

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakevenAttempt {
    pub method: BreakevenMethod,
    pub at: DateTime<Utc>,
    pub success: bool,
    pub price: Option<Price>,
    pub error: Option<String>,
}

// =============================================================================
// Protection State
// =============================================================================

/// How well the position is currently protected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionStatus {
    Protected,
    PartiallyProtected,
    Unprotected,
    VerificationFailed,
    EmergencyMode,
}

impl ProtectionStatus {
    /// States after which the cascade is retried on a later tick
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            ProtectionStatus::Unprotected
                | ProtectionStatus::EmergencyMode
                | ProtectionStatus::VerificationFailed
        )
    }
}

impl fmt::Display for ProtectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtectionStatus::Protected => "PROTECTED",
            ProtectionStatus::PartiallyProtected => "PARTIALLY_PROTECTED",
            ProtectionStatus::Unprotected => "UNPROTECTED",
            ProtectionStatus::VerificationFailed => "VERIFICATION_FAILED",
            ProtectionStatus::EmergencyMode => "EMERGENCY_MODE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionState {
    pub status: ProtectionStatus,
    pub sl_order_id: Option<String>,
    pub sl_price: Option<Price>,
    pub verification_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl ProtectionState {
    fn initial(sl: Option<&SlOrder>, now: DateTime<Utc>) -> Self {
        Self {
            status: if sl.is_some() {
                ProtectionStatus::Protected
            } else {
                ProtectionStatus::Unprotected
            },
            sl_order_id: sl.map(|s| s.order_id.clone()),
            sl_price: sl.map(|s| s.trigger_price),
            verification_attempts: 0,
            updated_at: now,
        }
    }
}

// =============================================================================
// Position Monitor
// =============================================================================

/// Result of asking the record to advance its phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseChange {
    /// The phase moved forward
    Advanced { from: Phase, to: Phase },
    /// Target phase already holds
    Unchanged,
}

/// Authoritative per-position tracking record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMonitor {
    #[serde(default = "current_schema")]
    pub schema_version: u32,

    pub symbol: Symbol,
    pub side: Side,
    pub account: Account,

    pub entry_price: Price,
    /// Target size: filled plus resting entry legs at creation
    pub position_size: Quantity,
    /// Size currently held on the exchange
    pub remaining_size: Quantity,

    pub phase: Phase,
    pub phase_changed_at: DateTime<Utc>,
    pub tp1_hit: bool,
    pub sl_moved_to_breakeven: bool,

    pub created_at: DateTime<Utc>,
    pub last_check: DateTime<Utc>,
    /// Where alerts for this position go
    pub alert_target: String,

    pub tp_orders: Vec<TpOrder>,
    pub sl_order: Option<SlOrder>,
    #[serde(default)]
    pub entry_legs: Vec<EntryLeg>,

    #[serde(default)]
    pub breakeven_log: Vec<BreakevenAttempt>,
    pub protection: ProtectionState,

    /// Cumulative realized PnL last reported by the exchange
    #[serde(default)]
    pub last_realized_pnl: Decimal,
    /// Snapshot sequence of the first zero-size reading, awaiting confirmation
    #[serde(default)]
    pub zero_size_seq: Option<u64>,
}

fn current_schema() -> u32 {
    SCHEMA_VERSION
}

impl PositionMonitor {
    /// Create a record for a freshly opened position in `Building`.
    pub fn new(
        key: &MonitorKey,
        entry_price: Price,
        filled_size: Quantity,
        alert_target: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            symbol: key.symbol.clone(),
            side: key.side,
            account: key.account,
            entry_price,
            position_size: filled_size,
            remaining_size: filled_size,
            phase: Phase::Building,
            phase_changed_at: now,
            tp1_hit: false,
            sl_moved_to_breakeven: false,
            created_at: now,
            last_check: now,
            alert_target: alert_target.into(),
            tp_orders: Vec::new(),
            sl_order: None,
            entry_legs: Vec::new(),
            breakeven_log: Vec::new(),
            protection: ProtectionState::initial(None, now),
            last_realized_pnl: Decimal::ZERO,
            zero_size_seq: None,
        }
    }

    /// Attach a stop and mark the record protected.
    pub fn with_stop(mut self, sl: SlOrder) -> Self {
        self.protection = ProtectionState::initial(Some(&sl), Utc::now());
        self.sl_order = Some(sl);
        self
    }

    /// Attach resting entry legs; target size grows by their quantity.
    pub fn with_entry_legs(mut self, legs: Vec<EntryLeg>) -> Self {
        let pending: Quantity = legs
            .iter()
            .filter(|l| l.status == EntryLegStatus::Open)
            .map(|l| l.quantity)
            .sum();
        self.position_size = self.remaining_size + pending;
        self.entry_legs = legs;
        self
    }

    /// Monitor key
    pub fn key(&self) -> MonitorKey {
        MonitorKey::new(self.symbol.clone(), self.side, self.account)
    }

    /// Terminal
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Take-profits currently live on the exchange
    pub fn open_tps(&self) -> impl Iterator<Item = &TpOrder> {
        self.tp_orders.iter().filter(|t| t.is_live())
    }

    /// Sum of live take-profit quantities
    pub fn live_tp_quantity(&self) -> Quantity {
        self.open_tps().map(|t| t.quantity).sum()
    }

    /// Resting entry legs
    pub fn open_entry_legs(&self) -> impl Iterator<Item = &EntryLeg> {
        self.entry_legs.iter().filter(|l| l.status == EntryLegStatus::Open)
    }

    /// Quantity still resting in entry legs
    pub fn pending_entry_quantity(&self) -> Quantity {
        self.open_entry_legs().map(|l| l.quantity).sum()
    }

    /// Quantity the stop must cover.
    ///
    /// While building, this is the worst case: filled size plus every resting
    /// entry leg. Afterwards only the remaining size.
    pub fn tracked_exposure(&self) -> Quantity {
        match self.phase {
            Phase::Building => self.remaining_size + self.pending_entry_quantity(),
            Phase::ProfitTaking | Phase::Closed => self.remaining_size,
        }
    }

    /// Whether a live stop covers the tracked exposure
    pub fn sl_covers_exposure(&self) -> bool {
        match &self.sl_order {
            Some(sl) => sl.live && sl.quantity >= self.tracked_exposure(),
            None => self.tracked_exposure().is_zero(),
        }
    }

    /// Advance the phase.
    ///
    /// Re-entering the current phase is a no-op. Moving to `ProfitTaking`
    /// marks TP1 as hit.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` when `target` is behind
    /// the current phase.
    pub fn advance_phase(&mut self, target: Phase, now: DateTime<Utc>) -> Result<PhaseChange, DomainError> {
        if self.phase == target {
            return Ok(PhaseChange::Unchanged);
        }
        if !self.phase.can_advance_to(target) {
            return Err(DomainError::InvalidStateTransition(format!(
                "{} cannot move back to {}",
                self.phase, target
            )));
        }
        let from = self.phase;
        self.phase = target;
        self.phase_changed_at = now;
        if target == Phase::ProfitTaking {
            self.tp1_hit = true;
        }
        Ok(PhaseChange::Advanced { from, to: target })
    }

    /// Append to the breakeven audit log
    pub fn record_attempt(&mut self, attempt: BreakevenAttempt) {
        self.breakeven_log.push(attempt);
    }

    /// Number of successful breakeven attempts in the audit log
    pub fn breakeven_successes(&self) -> usize {
        self.breakeven_log.iter().filter(|a| a.success).count()
    }

    /// Fraction of the target size that is still held
    pub fn remaining_ratio(&self) -> Decimal {
        if self.position_size.is_zero() {
            return Decimal::ZERO;
        }
        self.remaining_size.as_decimal() / self.position_size.as_decimal()
    }
}

// =============================================================================
// Domain Rules
// =============================================================================

/// Stop price at which closing yields roughly zero net PnL after fees.
///
/// `entry × (1 + fee + margin)` for longs, `entry × (1 − fee − margin)` for shorts.
///
/// # Errors
/// Returns `DomainError::InvalidPrice` if the result is not positive.
pub fn calculate_breakeven_price(
    entry: Price,
    side: Side,
    fee_rate: Decimal,
    safety_margin: Decimal,
) -> Result<Price, DomainError> {
    Price::new(side.favorable(entry.as_decimal(), fee_rate + safety_margin))
}
