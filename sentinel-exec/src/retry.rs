//! Bounded retry and the order primitives built on it.
//!
//! Exchange-mutating calls are retried a bounded number of times with linear
//! backoff, and only for transient errors. A definite answer from the
//! exchange (rejected, not found) is returned to the caller on the spot.

use std::future::Future;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use sentinel_domain::{Price, Quantity, Symbol};

use crate::error::{ExecError, ExecResult};
use crate::ports::{ExchangeOrder, ExchangePort, OrderRequest};

// =============================================================================
// Retry Policy
// =============================================================================

/// How often and how patiently to retry a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after attempt `n` is `backoff × n`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    pub async fn retry_transient<T, F, Fut>(&self, op_name: &str, mut op: F) -> ExecResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExecResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Cancel
// =============================================================================

/// Outcome of a lenient cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The exchange cancelled the order
    Cancelled,
    /// The exchange no longer knows the order
    AlreadyGone,
}

/// Cancel an order, treating "order not found" as success.
///
/// An order the exchange cannot find has already been filled or cancelled,
/// so there is nothing left to remove. Reporting that as a failure would make
/// callers keep a phantom order and block replacements forever. Fill
/// attribution never relies on this outcome; it goes through fill detection.
pub async fn cancel_lenient(
    exchange: &dyn ExchangePort,
    policy: &RetryPolicy,
    symbol: &Symbol,
    order_id: &str,
) -> ExecResult<CancelOutcome> {
    let result = policy
        .retry_transient("cancel_order", || exchange.cancel_order(symbol, order_id))
        .await;
    match result {
        Ok(true) => Ok(CancelOutcome::Cancelled),
        Ok(false) | Err(ExecError::OrderNotFound(_)) => {
            debug!(order_id, symbol = %symbol, "Cancel target already gone");
            Ok(CancelOutcome::AlreadyGone)
        }
        Err(e) => Err(e),
    }
}

/// Place an order with transient retry.
pub async fn place_with_retry(
    exchange: &dyn ExchangePort,
    policy: &RetryPolicy,
    request: &OrderRequest,
) -> ExecResult<String> {
    policy
        .retry_transient("place_order", || exchange.place_order(request))
        .await
}

// =============================================================================
// Verification
// =============================================================================

/// What a verification read found
#[derive(Debug, Clone, PartialEq)]
pub enum StopVerification {
    /// Live, trigger and quantity as intended
    Confirmed(ExchangeOrder),
    /// Live but with a different trigger or quantity
    Mismatch(ExchangeOrder),
    /// Not in the open order list
    Missing,
}

impl StopVerification {
    /// Whether the stop is live as intended
    pub fn is_confirmed(&self) -> bool {
        matches!(self, StopVerification::Confirmed(_))
    }
}

/// Fresh read of the open orders to confirm a stop is live as intended.
///
/// `tolerance` is relative (0.0001 = 0.01%). Quantity is checked only when
/// `expected_qty` is given.
pub async fn verify_stop(
    exchange: &dyn ExchangePort,
    symbol: &Symbol,
    order_id: &str,
    expected_trigger: Price,
    expected_qty: Option<Quantity>,
    tolerance: Decimal,
) -> ExecResult<StopVerification> {
    let open = exchange.get_open_orders(Some(symbol)).await?;
    let Some(order) = open.into_iter().find(|o| o.order_id == order_id) else {
        return Ok(StopVerification::Missing);
    };

    let trigger_ok = order
        .trigger_price
        .is_some_and(|p| expected_trigger.within_tolerance(p, tolerance));
    let qty_ok = expected_qty.map_or(true, |q| order.quantity == q);

    if trigger_ok && qty_ok {
        Ok(StopVerification::Confirmed(order))
    } else {
        Ok(StopVerification::Mismatch(order))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{Injected, StubExchange};
    use rust_decimal_macros::dec;
    use sentinel_domain::Side;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast()
            .retry_transient("op", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExecError::Timeout("slow".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: ExecResult<()> = fast()
            .retry_transient("op", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExecError::RateLimited("slow down".into()))
            })
            .await;
        assert!(matches!(result, Err(ExecError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_definite_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: ExecResult<()> = fast()
            .retry_transient("op", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExecError::OrderRejected("bad".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_not_found_is_already_gone() {
        let exchange = StubExchange::new(dec!(100));
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();

        let outcome = cancel_lenient(&exchange, &fast(), &symbol, "missing").await.unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_cancel_rejection_propagates() {
        let exchange = StubExchange::new(dec!(100));
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();
        let req = OrderRequest::stop_loss(
            &symbol,
            Side::Long,
            Price::new(dec!(99)).unwrap(),
            Quantity::new(dec!(1)).unwrap(),
        );
        let id = exchange.place_order(&req).await.unwrap();

        exchange.script_cancels([Injected::Reject]);
        assert!(cancel_lenient(&exchange, &fast(), &symbol, &id).await.is_err());
        assert_eq!(
            cancel_lenient(&exchange, &fast(), &symbol, &id).await.unwrap(),
            CancelOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn test_verify_stop_detects_mismatch() {
        let exchange = StubExchange::new(dec!(100));
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();
        let trigger = Price::new(dec!(100.08)).unwrap();
        let qty = Quantity::new(dec!(15)).unwrap();

        exchange.script_places([Injected::SkewTrigger(dec!(0.5))]);
        let id = exchange
            .place_order(&OrderRequest::stop_loss(&symbol, Side::Long, trigger, qty))
            .await
            .unwrap();

        let v = verify_stop(&exchange, &symbol, &id, trigger, Some(qty), dec!(0.0001)).await.unwrap();
        assert!(matches!(v, StopVerification::Mismatch(_)));

        let id = exchange
            .place_order(&OrderRequest::stop_loss(&symbol, Side::Long, trigger, qty))
            .await
            .unwrap();
        let v = verify_stop(&exchange, &symbol, &id, trigger, Some(qty), dec!(0.0001)).await.unwrap();
        assert!(v.is_confirmed());

        let v = verify_stop(&exchange, &symbol, "nope", trigger, None, dec!(0.0001)).await.unwrap();
        assert_eq!(v, StopVerification::Missing);
    }
}
