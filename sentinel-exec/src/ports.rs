//! Execution layer port definitions.
//!
//! Ports define the interfaces for the exchange. Adapters implement them for a
//! specific venue; `StubExchange` implements them in memory for tests.
//!
//! Every call is assumed to carry its own transport-level retry. Errors that
//! come back are classified by [`ExecError::is_transient`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use sentinel_domain::{
    Account, ObservedKind, ObservedOrder, OrderSide, Price, Quantity, Side, Symbol,
};

use crate::error::{ExecError, ExecResult};

// =============================================================================
// Exchange Port
// =============================================================================

/// Port for one trading account on the exchange.
///
/// Implementations:
/// - `StubExchange` - in-memory simulation with failure injection
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Place an order.
    ///
    /// # Returns
    ///
    /// The exchange-assigned order ID.
    async fn place_order(&self, request: &OrderRequest) -> ExecResult<String>;

    /// Cancel an existing order.
    ///
    /// `Ok(true)` when the order was cancelled, `Ok(false)` when the exchange
    /// had nothing to cancel. An unknown order may also surface as
    /// `ExecError::OrderNotFound`.
    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExecResult<bool>;

    /// Amend a resting conditional order in place.
    async fn amend_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        trigger_price: Option<Price>,
        quantity: Option<Quantity>,
    ) -> ExecResult<()>;

    /// Open orders for one symbol, or for the whole account when `None`.
    async fn get_open_orders(&self, symbol: Option<&Symbol>) -> ExecResult<Vec<ExchangeOrder>>;

    /// Closed orders for a symbol, optionally narrowed to one order.
    async fn get_order_history(
        &self,
        symbol: &Symbol,
        order_id: Option<&str>,
    ) -> ExecResult<Vec<ExchangeOrder>>;

    /// Open positions for one symbol, or for the whole account when `None`.
    async fn get_positions(&self, symbol: Option<&Symbol>) -> ExecResult<Vec<ExchangePosition>>;

    /// Last traded price.
    async fn get_current_price(&self, symbol: &Symbol) -> ExecResult<Price>;
}

// =============================================================================
// Requests
// =============================================================================

/// What kind of order to place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit { price: Price },
    StopMarket { trigger_price: Price },
}

/// Order placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Quantity,
    pub reduce_only: bool,
    /// Unique ID for idempotency
    pub client_order_id: String,
    /// Hedge-mode position index (1 = long, 2 = short)
    pub position_idx: u8,
}

impl OrderRequest {
    /// Reduce-only stop-market exit for a position of `side`.
    pub fn stop_loss(symbol: &Symbol, side: Side, trigger_price: Price, quantity: Quantity) -> Self {
        Self {
            symbol: symbol.clone(),
            side: side.exit_action(),
            kind: OrderKind::StopMarket { trigger_price },
            quantity,
            reduce_only: true,
            client_order_id: new_client_order_id("sl"),
            position_idx: side.position_idx(),
        }
    }

    /// Reduce-only limit exit for a position of `side`.
    pub fn take_profit(symbol: &Symbol, side: Side, price: Price, quantity: Quantity) -> Self {
        Self {
            symbol: symbol.clone(),
            side: side.exit_action(),
            kind: OrderKind::Limit { price },
            quantity,
            reduce_only: true,
            client_order_id: new_client_order_id("tp"),
            position_idx: side.position_idx(),
        }
    }

    /// Limit entry that adds to a position of `side`.
    pub fn entry_limit(symbol: &Symbol, side: Side, price: Price, quantity: Quantity) -> Self {
        Self {
            symbol: symbol.clone(),
            side: side.entry_action(),
            kind: OrderKind::Limit { price },
            quantity,
            reduce_only: false,
            client_order_id: new_client_order_id("entry"),
            position_idx: side.position_idx(),
        }
    }
}

/// Time-ordered client order id with a short purpose prefix.
pub fn new_client_order_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::now_v7().simple())
}

// =============================================================================
// Exchange views
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// An order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub quantity: Quantity,
    pub filled_quantity: Quantity,
    pub status: OrderStatus,
    pub reduce_only: bool,
    pub position_idx: u8,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeOrder {
    /// Reduce-only conditional order, i.e. a protective stop
    pub fn is_stop(&self) -> bool {
        self.order_type == OrderType::StopMarket && self.reduce_only
    }

    /// Whether the order belongs to a position of `side` (hedge mode index)
    pub fn belongs_to(&self, side: Side) -> bool {
        self.position_idx == side.position_idx()
    }

    /// Exchange-agnostic view used for orphan adoption
    pub fn observe(&self) -> Option<ObservedOrder> {
        let kind = match self.order_type {
            OrderType::StopMarket => ObservedKind::Stop {
                trigger_price: self.trigger_price?,
            },
            OrderType::Limit => ObservedKind::Limit { price: self.price? },
            OrderType::Market => return None,
        };
        Some(ObservedOrder {
            order_id: self.order_id.clone(),
            side: self.side,
            kind,
            quantity: self.quantity,
            reduce_only: self.reduce_only,
        })
    }
}

/// A position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: Symbol,
    pub side: Side,
    pub size: Quantity,
    pub entry_price: Price,
    /// Cumulative realized PnL for the position
    pub realized_pnl: Decimal,
    pub mark_price: Price,
}

// =============================================================================
// Router
// =============================================================================

/// One exchange connection per trading account.
#[derive(Clone)]
pub struct ExchangeRouter {
    primary: Arc<dyn ExchangePort>,
    mirror: Option<Arc<dyn ExchangePort>>,
}

impl ExchangeRouter {
    /// Router with only the primary account.
    pub fn new(primary: Arc<dyn ExchangePort>) -> Self {
        Self { primary, mirror: None }
    }

    /// Add the mirror account.
    pub fn with_mirror(mut self, mirror: Arc<dyn ExchangePort>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Connection for `account`.
    ///
    /// # Errors
    /// `ExecError::Config` when the mirror account is requested but not configured.
    pub fn for_account(&self, account: Account) -> ExecResult<Arc<dyn ExchangePort>> {
        match account {
            Account::Primary => Ok(Arc::clone(&self.primary)),
            Account::Mirror => self
                .mirror
                .clone()
                .ok_or_else(|| ExecError::Config("mirror account not configured".into())),
        }
    }

    /// Whether the mirror account is configured
    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    /// Accounts with a connection
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts = vec![Account::Primary];
        if self.has_mirror() {
            accounts.push(Account::Mirror);
        }
        accounts
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubExchange;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stop_loss_request_exits_position() {
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();
        let req = OrderRequest::stop_loss(
            &symbol,
            Side::Short,
            Price::new(dec!(101)).unwrap(),
            Quantity::new(dec!(1)).unwrap(),
        );
        assert_eq!(req.side, OrderSide::Buy);
        assert!(req.reduce_only);
        assert_eq!(req.position_idx, 2);
        assert!(req.client_order_id.starts_with("sl-"));
    }

    #[test]
    fn test_router_requires_mirror() {
        let router = ExchangeRouter::new(Arc::new(StubExchange::new(dec!(100))));
        assert!(router.for_account(Account::Primary).is_ok());
        assert!(matches!(router.for_account(Account::Mirror), Err(ExecError::Config(_))));
        assert_eq!(router.accounts(), vec![Account::Primary]);

        let router = router.with_mirror(Arc::new(StubExchange::new(dec!(100))));
        assert!(router.for_account(Account::Mirror).is_ok());
        assert_eq!(router.accounts().len(), 2);
    }

    #[test]
    fn test_observe_skips_market_orders() {
        let order = ExchangeOrder {
            order_id: "1".into(),
            client_order_id: "c".into(),
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            side: OrderSide::Sell,
            order_type: OrderType::StopMarket,
            price: None,
            trigger_price: Some(Price::new(dec!(99)).unwrap()),
            quantity: Quantity::new(dec!(1)).unwrap(),
            filled_quantity: Quantity::zero(),
            status: OrderStatus::New,
            reduce_only: true,
            position_idx: 1,
            updated_at: Utc::now(),
        };
        assert!(order.is_stop());
        assert!(order.belongs_to(Side::Long));
        assert!(matches!(order.observe().unwrap().kind, ObservedKind::Stop { .. }));

        let market = ExchangeOrder { order_type: OrderType::Market, ..order };
        assert!(market.observe().is_none());
    }
}
