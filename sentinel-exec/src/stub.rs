//! Stub implementation for testing.
//!
//! An in-memory exchange account: positions, resting orders, order history
//! and prices, with scripted failure injection per operation. No real API
//! calls are made.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use sentinel_domain::{Price, Quantity, Side, Symbol};

use crate::error::{ExecError, ExecResult};
use crate::ports::{
    ExchangeOrder, ExchangePort, ExchangePosition, OrderKind, OrderRequest, OrderStatus, OrderType,
};

// =============================================================================
// Failure Injection
// =============================================================================

/// Scripted outcome for the next call of one operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Injected {
    /// Behave normally
    Pass,
    /// Definite rejection (`OrderRejected`)
    Reject,
    /// Transient failure (`Timeout`)
    Transient,
    /// `OrderNotFound`
    NotFound,
    /// Accept a stop placement or amendment but move its trigger by this
    /// absolute amount, so verification reads see the wrong price
    SkewTrigger(Decimal),
}

#[derive(Debug, Default)]
struct Scripts {
    places: VecDeque<Injected>,
    cancels: VecDeque<Injected>,
    amends: VecDeque<Injected>,
    reads: VecDeque<Injected>,
}

/// Call counters for assertions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub places: u32,
    pub cancels: u32,
    pub amends: u32,
    pub open_order_reads: u32,
    pub position_reads: u32,
    pub history_reads: u32,
}

// =============================================================================
// Stub Exchange
// =============================================================================

#[derive(Debug, Default)]
struct StubState {
    positions: HashMap<(String, Side), ExchangePosition>,
    open: Vec<ExchangeOrder>,
    history: Vec<ExchangeOrder>,
    prices: HashMap<String, Decimal>,
    order_counter: u64,
    scripts: Scripts,
    calls: CallCounts,
    /// Live reduce-only stop count per symbol, recorded on every open-order read
    stop_observations: Vec<(String, usize)>,
    placed: Vec<OrderRequest>,
}

/// Stub exchange for testing.
///
/// Market orders fill immediately at the current price. Limit and stop
/// orders rest until a test calls [`StubExchange::fill_order`].
pub struct StubExchange {
    state: RwLock<StubState>,
    /// Default price for unknown symbols
    default_price: Decimal,
}

impl StubExchange {
    /// Create a new stub exchange with default price.
    pub fn new(default_price: Decimal) -> Self {
        Self {
            state: RwLock::new(StubState::default()),
            default_price,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StubState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StubState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // -------------------------------------------------------------------------
    // Test setup
    // -------------------------------------------------------------------------

    /// Set price for a specific symbol.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.write().prices.insert(symbol.to_string(), price);
    }

    /// Open (or overwrite) a position.
    pub fn set_position(&self, symbol: &Symbol, side: Side, size: Decimal, entry_price: Decimal) {
        let mark = self.price_of(&symbol.as_pair());
        let mut state = self.write();
        match (Quantity::new(size), Price::new(entry_price), Price::new(mark)) {
            (Ok(size), Ok(entry_price), Ok(mark_price)) => {
                state.positions.insert(
                    (symbol.as_pair(), side),
                    ExchangePosition {
                        symbol: symbol.clone(),
                        side,
                        size,
                        entry_price,
                        realized_pnl: Decimal::ZERO,
                        mark_price,
                    },
                );
            }
            _ => {
                state.positions.remove(&(symbol.as_pair(), side));
            }
        }
    }

    /// Change a position's size without touching orders (external activity).
    pub fn set_position_size(&self, symbol: &Symbol, side: Side, size: Decimal) {
        let mut state = self.write();
        if let Some(pos) = state.positions.get_mut(&(symbol.as_pair(), side)) {
            pos.size = Quantity::new(size).unwrap_or_else(|_| Quantity::zero());
        }
    }

    /// Remove a position entirely.
    pub fn close_position(&self, symbol: &Symbol, side: Side) {
        self.write().positions.remove(&(symbol.as_pair(), side));
    }

    /// Add to a position's realized PnL.
    pub fn add_realized_pnl(&self, symbol: &Symbol, side: Side, delta: Decimal) {
        let mut state = self.write();
        if let Some(pos) = state.positions.get_mut(&(symbol.as_pair(), side)) {
            pos.realized_pnl += delta;
        }
    }

    /// Script the next place-order outcomes, in order.
    pub fn script_places(&self, outcomes: impl IntoIterator<Item = Injected>) {
        self.write().scripts.places.extend(outcomes);
    }

    /// Script the next cancel outcomes, in order.
    pub fn script_cancels(&self, outcomes: impl IntoIterator<Item = Injected>) {
        self.write().scripts.cancels.extend(outcomes);
    }

    /// Script the next amend outcomes, in order.
    pub fn script_amends(&self, outcomes: impl IntoIterator<Item = Injected>) {
        self.write().scripts.amends.extend(outcomes);
    }

    /// Script the next read outcomes (open orders, positions, history), in order.
    pub fn script_reads(&self, outcomes: impl IntoIterator<Item = Injected>) {
        self.write().scripts.reads.extend(outcomes);
    }

    /// Fill a resting order completely at its own price.
    ///
    /// Reduce-only fills shrink the position and book realized PnL; entry
    /// fills grow it and move the average entry.
    pub fn fill_order(&self, order_id: &str) -> bool {
        let mut state = self.write();
        let Some(idx) = state.open.iter().position(|o| o.order_id == order_id) else {
            return false;
        };
        let mut order = state.open.remove(idx);
        let side = if order.position_idx == Side::Long.position_idx() {
            Side::Long
        } else {
            Side::Short
        };
        let fill_price = order
            .price
            .or(order.trigger_price)
            .map(|p| p.as_decimal())
            .unwrap_or(self.default_price);
        let qty = order.quantity.as_decimal();

        if let Some(pos) = state.positions.get_mut(&(order.symbol.as_pair(), side)) {
            let size = pos.size.as_decimal();
            let entry = pos.entry_price.as_decimal();
            if order.reduce_only {
                let closed = qty.min(size);
                let per_unit = match side {
                    Side::Long => fill_price - entry,
                    Side::Short => entry - fill_price,
                };
                pos.realized_pnl += per_unit * closed;
                pos.size = pos.size.saturating_sub(Quantity::new(closed).unwrap_or_else(|_| Quantity::zero()));
            } else {
                let new_size = size + qty;
                if let Ok(avg) = Price::new((entry * size + fill_price * qty) / new_size) {
                    pos.entry_price = avg;
                }
                pos.size = pos.size + order.quantity;
            }
        }

        order.status = OrderStatus::Filled;
        order.filled_quantity = order.quantity;
        order.updated_at = Utc::now();
        state.history.push(order);
        true
    }

    /// Make an order vanish from the open list without any history record.
    pub fn drop_order_silently(&self, order_id: &str) {
        self.write().open.retain(|o| o.order_id != order_id);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Get price for a symbol (or default).
    pub fn price_of(&self, symbol: &str) -> Decimal {
        self.read().prices.get(symbol).copied().unwrap_or(self.default_price)
    }

    /// Resting orders
    pub fn open_orders(&self) -> Vec<ExchangeOrder> {
        self.read().open.clone()
    }

    /// Resting reduce-only stops for a symbol
    pub fn live_stops(&self, symbol: &Symbol) -> Vec<ExchangeOrder> {
        self.read()
            .open
            .iter()
            .filter(|o| o.is_stop() && o.symbol == *symbol)
            .cloned()
            .collect()
    }

    /// Stop counts seen by every open-order read for `symbol`
    pub fn stop_observations(&self, symbol: &Symbol) -> Vec<usize> {
        let pair = symbol.as_pair();
        self.read()
            .stop_observations
            .iter()
            .filter(|(s, _)| *s == pair)
            .map(|(_, n)| *n)
            .collect()
    }

    /// Every accepted placement request, in order
    pub fn placed_requests(&self) -> Vec<OrderRequest> {
        self.read().placed.clone()
    }

    /// Call counters
    pub fn calls(&self) -> CallCounts {
        self.read().calls
    }

    /// Position as currently held
    pub fn position(&self, symbol: &Symbol, side: Side) -> Option<ExchangePosition> {
        self.read().positions.get(&(symbol.as_pair(), side)).cloned()
    }

    fn next_order_id(state: &mut StubState) -> String {
        state.order_counter += 1;
        format!("STUB-{}", state.order_counter)
    }
}

fn injected_error(op: &str, injected: Injected) -> Option<ExecError> {
    match injected {
        Injected::Pass | Injected::SkewTrigger(_) => None,
        Injected::Reject => Some(ExecError::OrderRejected(format!("Simulated {op} rejection"))),
        Injected::Transient => Some(ExecError::Timeout(format!("Simulated {op} timeout"))),
        Injected::NotFound => Some(ExecError::OrderNotFound(format!("Simulated {op} not found"))),
    }
}

#[async_trait]
impl ExchangePort for StubExchange {
    async fn place_order(&self, request: &OrderRequest) -> ExecResult<String> {
        let mark = self.price_of(&request.symbol.as_pair());
        let mut state = self.write();
        state.calls.places += 1;
        let injected = state.scripts.places.pop_front().unwrap_or(Injected::Pass);
        if let Some(err) = injected_error("place", injected) {
            return Err(err);
        }

        let order_id = Self::next_order_id(&mut state);
        state.placed.push(request.clone());
        let now = Utc::now();

        let (order_type, price, trigger_price) = match request.kind {
            OrderKind::Market => (OrderType::Market, None, None),
            OrderKind::Limit { price } => (OrderType::Limit, Some(price), None),
            OrderKind::StopMarket { trigger_price } => {
                let trigger_price = match injected {
                    Injected::SkewTrigger(delta) => Price::new(trigger_price.as_decimal() + delta)?,
                    _ => trigger_price,
                };
                (OrderType::StopMarket, None, Some(trigger_price))
            }
        };

        let order = ExchangeOrder {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type,
            price,
            trigger_price,
            quantity: request.quantity,
            filled_quantity: Quantity::zero(),
            status: OrderStatus::New,
            reduce_only: request.reduce_only,
            position_idx: request.position_idx,
            updated_at: now,
        };
        state.open.push(order);
        drop(state);

        if order_type == OrderType::Market {
            if let Ok(price) = Price::new(mark) {
                let mut state = self.write();
                if let Some(o) = state.open.iter_mut().find(|o| o.order_id == order_id) {
                    o.price = Some(price);
                }
            }
            self.fill_order(&order_id);
        }

        tracing::debug!(order_id = %order_id, symbol = %request.symbol, "Stub: order placed");
        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExecResult<bool> {
        let mut state = self.write();
        state.calls.cancels += 1;
        let injected = state.scripts.cancels.pop_front().unwrap_or(Injected::Pass);
        if let Some(err) = injected_error("cancel", injected) {
            return Err(err);
        }

        let Some(idx) = state
            .open
            .iter()
            .position(|o| o.order_id == order_id && o.symbol == *symbol)
        else {
            return Err(ExecError::OrderNotFound(order_id.to_string()));
        };
        let mut order = state.open.remove(idx);
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        state.history.push(order);

        tracing::debug!(order_id, "Stub: order cancelled");
        Ok(true)
    }

    async fn amend_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        trigger_price: Option<Price>,
        quantity: Option<Quantity>,
    ) -> ExecResult<()> {
        let mut state = self.write();
        state.calls.amends += 1;
        let injected = state.scripts.amends.pop_front().unwrap_or(Injected::Pass);
        if let Some(err) = injected_error("amend", injected) {
            return Err(err);
        }

        let order = state
            .open
            .iter_mut()
            .find(|o| o.order_id == order_id && o.symbol == *symbol)
            .ok_or_else(|| ExecError::OrderNotFound(order_id.to_string()))?;
        if let Some(trigger) = trigger_price {
            if order.order_type != OrderType::StopMarket {
                return Err(ExecError::OrderRejected("only stop orders carry a trigger".into()));
            }
            order.trigger_price = Some(match injected {
                Injected::SkewTrigger(delta) => Price::new(trigger.as_decimal() + delta)?,
                _ => trigger,
            });
        }
        if let Some(qty) = quantity {
            order.quantity = qty;
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_open_orders(&self, symbol: Option<&Symbol>) -> ExecResult<Vec<ExchangeOrder>> {
        let mut state = self.write();
        state.calls.open_order_reads += 1;
        let injected = state.scripts.reads.pop_front().unwrap_or(Injected::Pass);
        if let Some(err) = injected_error("open orders read", injected) {
            return Err(err);
        }

        let orders: Vec<ExchangeOrder> = state
            .open
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == *s))
            .cloned()
            .collect();

        let mut per_symbol: HashMap<String, usize> = HashMap::new();
        for o in &state.open {
            let entry = per_symbol.entry(o.symbol.as_pair()).or_default();
            if o.is_stop() {
                *entry += 1;
            }
        }
        for pos in state.positions.values() {
            per_symbol.entry(pos.symbol.as_pair()).or_default();
        }
        let mut observed: Vec<(String, usize)> = per_symbol.into_iter().collect();
        observed.sort();
        state.stop_observations.extend(observed);

        Ok(orders)
    }

    async fn get_order_history(
        &self,
        symbol: &Symbol,
        order_id: Option<&str>,
    ) -> ExecResult<Vec<ExchangeOrder>> {
        let mut state = self.write();
        state.calls.history_reads += 1;
        let injected = state.scripts.reads.pop_front().unwrap_or(Injected::Pass);
        if let Some(err) = injected_error("history read", injected) {
            return Err(err);
        }

        Ok(state
            .history
            .iter()
            .filter(|o| o.symbol == *symbol && order_id.map_or(true, |id| o.order_id == id))
            .cloned()
            .collect())
    }

    async fn get_positions(&self, symbol: Option<&Symbol>) -> ExecResult<Vec<ExchangePosition>> {
        let mut state = self.write();
        state.calls.position_reads += 1;
        let injected = state.scripts.reads.pop_front().unwrap_or(Injected::Pass);
        if let Some(err) = injected_error("positions read", injected) {
            return Err(err);
        }

        let prices = state.prices.clone();
        Ok(state
            .positions
            .values()
            .filter(|p| !p.size.is_zero() && symbol.map_or(true, |s| p.symbol == *s))
            .map(|p| {
                let mut p = p.clone();
                if let Some(mark) = prices.get(&p.symbol.as_pair()).and_then(|m| Price::new(*m).ok()) {
                    p.mark_price = mark;
                }
                p
            })
            .collect())
    }

    async fn get_current_price(&self, symbol: &Symbol) -> ExecResult<Price> {
        Ok(Price::new(self.price_of(&symbol.as_pair()))?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    fn qty(v: Decimal) -> Quantity {
        Quantity::new(v).unwrap()
    }

    fn price(v: Decimal) -> Price {
        Price::new(v).unwrap()
    }

    #[tokio::test]
    async fn test_take_profit_fill_reduces_position_and_books_pnl() {
        let exchange = StubExchange::new(dec!(100));
        exchange.set_position(&btc(), Side::Long, dec!(100), dec!(100));

        let id = exchange
            .place_order(&OrderRequest::take_profit(&btc(), Side::Long, price(dec!(102)), qty(dec!(85))))
            .await
            .unwrap();
        assert!(exchange.fill_order(&id));

        let pos = exchange.position(&btc(), Side::Long).unwrap();
        assert_eq!(pos.size.as_decimal(), dec!(15));
        assert_eq!(pos.realized_pnl, dec!(170));

        let history = exchange.get_order_history(&btc(), Some(&id)).await.unwrap();
        assert_eq!(history[0].status, OrderStatus::Filled);
        assert!(exchange.get_open_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_fill_moves_average_entry() {
        let exchange = StubExchange::new(dec!(100));
        exchange.set_position(&btc(), Side::Long, dec!(50), dec!(100));

        let id = exchange
            .place_order(&OrderRequest::entry_limit(&btc(), Side::Long, price(dec!(90)), qty(dec!(50))))
            .await
            .unwrap();
        exchange.fill_order(&id);

        let pos = exchange.position(&btc(), Side::Long).unwrap();
        assert_eq!(pos.size.as_decimal(), dec!(100));
        assert_eq!(pos.entry_price.as_decimal(), dec!(95));
    }

    #[tokio::test]
    async fn test_scripted_failures_apply_in_order() {
        let exchange = StubExchange::new(dec!(100));
        exchange.script_places([Injected::Reject, Injected::Transient]);
        let req = OrderRequest::stop_loss(&btc(), Side::Long, price(dec!(99)), qty(dec!(1)));

        assert!(matches!(exchange.place_order(&req).await, Err(ExecError::OrderRejected(_))));
        assert!(matches!(exchange.place_order(&req).await, Err(ExecError::Timeout(_))));
        assert!(exchange.place_order(&req).await.is_ok());
        assert_eq!(exchange.calls().places, 3);
        assert_eq!(exchange.placed_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_amend_moves_trigger() {
        let exchange = StubExchange::new(dec!(100));
        let id = exchange
            .place_order(&OrderRequest::stop_loss(&btc(), Side::Long, price(dec!(99)), qty(dec!(1))))
            .await
            .unwrap();

        exchange
            .amend_order(&btc(), &id, Some(price(dec!(100.08))), Some(qty(dec!(0.5))))
            .await
            .unwrap();
        let stop = &exchange.live_stops(&btc())[0];
        assert_eq!(stop.trigger_price.unwrap().as_decimal(), dec!(100.08));
        assert_eq!(stop.quantity.as_decimal(), dec!(0.5));

        assert!(matches!(
            exchange.amend_order(&btc(), "missing", None, None).await,
            Err(ExecError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_market_order_fills_at_mark() {
        let exchange = StubExchange::new(dec!(100));
        exchange.set_price("BTCUSDT", dec!(110));
        exchange.set_position(&btc(), Side::Long, dec!(10), dec!(100));

        let req = OrderRequest {
            kind: OrderKind::Market,
            ..OrderRequest::take_profit(&btc(), Side::Long, price(dec!(1)), qty(dec!(10)))
        };
        exchange.place_order(&req).await.unwrap();

        assert!(exchange.get_positions(Some(&btc())).await.unwrap().is_empty());
        assert_eq!(exchange.position(&btc(), Side::Long).unwrap().realized_pnl, dec!(100));
    }

    #[tokio::test]
    async fn test_stop_observations_track_live_stops() {
        let exchange = StubExchange::new(dec!(100));
        exchange.set_position(&btc(), Side::Long, dec!(1), dec!(100));
        exchange.get_open_orders(None).await.unwrap();
        exchange
            .place_order(&OrderRequest::stop_loss(&btc(), Side::Long, price(dec!(99)), qty(dec!(1))))
            .await
            .unwrap();
        exchange.get_open_orders(Some(&btc())).await.unwrap();

        assert_eq!(exchange.stop_observations(&btc()), vec![0, 1]);
    }
}
