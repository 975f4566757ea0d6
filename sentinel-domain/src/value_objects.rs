//! Value Objects for the Sentinel domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Price must be positive
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    /// Quantity must not be negative
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Symbol must be valid trading pair
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Take-profit ladder is malformed
    #[error("Invalid ladder: {0}")]
    InvalidLadder(String),

    /// Instrument rules are malformed
    #[error("Invalid instrument rules: {0}")]
    InvalidInstrument(String),

    /// Monitor key could not be parsed
    #[error("Invalid monitor key: {0}")]
    InvalidKey(String),

    /// Invalid phase transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Price
// =============================================================================

/// Price represents a positive decimal price
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    /// Create a new Price with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPrice` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidPrice(format!("Price must be positive, got {value}")));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Relative distance to another price, as a fraction of `self`.
    pub fn distance_ratio(&self, other: Price) -> Decimal {
        ((other.0 - self.0) / self.0).abs()
    }

    /// Whether two prices agree within a relative tolerance (fraction, e.g. 0.0001).
    pub fn within_tolerance(&self, other: Price, tolerance: Decimal) -> bool {
        self.distance_ratio(other) <= tolerance
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// Quantity represents a non-negative decimal quantity
///
/// Zero is a legal value: a fully closed position has zero remaining size.
///
/// # Invariants
/// - Must be >= 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Create a new Quantity with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidQuantity` if value < 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value < Decimal::ZERO {
            return Err(DomainError::InvalidQuantity(format!(
                "Quantity must not be negative, got {value}"
            )));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// The zero quantity
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Whether this quantity is zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Subtract, clamping at zero
    pub fn saturating_sub(&self, other: Quantity) -> Quantity {
        Self((self.0 - other.0).max(Decimal::ZERO))
    }
}

impl std::ops::Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        iter.fold(Quantity::zero(), |acc, q| acc + q)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Symbol
// =============================================================================

/// Symbol represents a derivatives trading pair (e.g., BTCUSDT)
///
/// # Invariants
/// - Must be valid format (base + quote)
/// - Base and quote must be non-empty
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Create a Symbol from a trading pair string
    ///
    /// # Examples
    /// ```
    /// # use sentinel_domain::value_objects::Symbol;
    /// let symbol = Symbol::from_pair("BTCUSDT").unwrap();
    /// assert_eq!(symbol.base(), "BTC");
    /// assert_eq!(symbol.quote(), "USDT");
    /// ```
    ///
    /// # Errors
    /// Returns `DomainError::InvalidSymbol` if format is invalid
    pub fn from_pair(pair: &str) -> Result<Self, DomainError> {
        // Settlement currencies for linear perpetuals
        const QUOTE_CURRENCIES: &[&str] = &["USDT", "USDC", "BUSD", "USD"];

        for quote in QUOTE_CURRENCIES {
            if let Some(base) = pair.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(Self {
                        base: base.to_string(),
                        quote: quote.to_string(),
                    });
                }
            }
        }

        Err(DomainError::InvalidSymbol(format!("Cannot parse trading pair: {}", pair)))
    }

    /// Get the base currency
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Get the quote currency
    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Get the trading pair as string (e.g., "BTCUSDT")
    pub fn as_pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_pair())
    }
}

// =============================================================================
// Side
// =============================================================================

/// Side represents the position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Long position (buy low, sell high)
    Long,
    /// Short position (sell high, buy low)
    Short,
}

impl Side {
    /// Get the entry action for this side
    ///
    /// Long → Buy, Short → Sell
    pub fn entry_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Get the exit action for this side
    ///
    /// Long → Sell, Short → Buy
    pub fn exit_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// Hedge-mode position index used by the exchange (1 = long, 2 = short).
    pub fn position_idx(&self) -> u8 {
        match self {
            Side::Long => 1,
            Side::Short => 2,
        }
    }

    /// Whether `candidate` is a strictly more protective stop than `current`.
    ///
    /// Long stops improve upwards, short stops improve downwards.
    pub fn improves_stop(&self, candidate: Price, current: Price) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }

    /// Move `price` by `fraction` in the profitable direction of this side.
    ///
    /// Long → price × (1 + fraction), Short → price × (1 − fraction).
    pub fn favorable(&self, price: Decimal, fraction: Decimal) -> Decimal {
        match self {
            Side::Long => price * (Decimal::ONE + fraction),
            Side::Short => price * (Decimal::ONE - fraction),
        }
    }

    /// Move `price` by `fraction` in the adverse direction of this side.
    pub fn adverse(&self, price: Decimal, fraction: Decimal) -> Decimal {
        match self {
            Side::Long => price * (Decimal::ONE - fraction),
            Side::Short => price * (Decimal::ONE + fraction),
        }
    }

    /// Short lowercase label used in keys ("long" / "short").
    pub fn label(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Side {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(DomainError::InvalidKey(format!("unknown side: {other}"))),
        }
    }
}

/// OrderSide represents the order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// Account
// =============================================================================

/// Trading account a monitor belongs to.
///
/// The mirror account replicates the primary's decisions with its own sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Account {
    /// The account whose decisions are authoritative
    Primary,
    /// Independently-sized account that follows the primary
    Mirror,
}

impl Account {
    /// Key label ("main" / "mirror")
    pub fn label(&self) -> &'static str {
        match self {
            Account::Primary => "main",
            Account::Mirror => "mirror",
        }
    }

    /// The paired account
    pub fn counterpart(&self) -> Account {
        match self {
            Account::Primary => Account::Mirror,
            Account::Mirror => Account::Primary,
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Account {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "primary" => Ok(Account::Primary),
            "mirror" => Ok(Account::Mirror),
            other => Err(DomainError::InvalidKey(format!("unknown account: {other}"))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
