//! Sentinel Execution Layer
//!
//! Everything that talks to the exchange.
//!
//! # Components
//!
//! - **Ports**: the `ExchangePort` trait, request/response types and the
//!   per-account `ExchangeRouter`
//! - **Retry**: bounded transient retry, lenient cancel, stop verification
//! - **Stub**: in-memory exchange with failure injection
//!
//! # Example
//!
//! ```rust,ignore
//! use sentinel_exec::{cancel_lenient, ExchangeRouter, RetryPolicy, StubExchange};
//! use std::sync::Arc;
//!
//! let router = ExchangeRouter::new(Arc::new(StubExchange::new(dec!(95000))));
//! let exchange = router.for_account(Account::Primary)?;
//! cancel_lenient(exchange.as_ref(), &RetryPolicy::default(), &symbol, "123").await?;
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod ports;
pub mod retry;
pub mod stub;

// Re-exports for convenience
pub use error::{ExecError, ExecResult};
pub use ports::{
    new_client_order_id, ExchangeOrder, ExchangePort, ExchangePosition, ExchangeRouter, OrderKind,
    OrderRequest, OrderStatus, OrderType,
};
pub use retry::{
    cancel_lenient, place_with_retry, verify_stop, CancelOutcome, RetryPolicy, StopVerification,
};
pub use stub::{CallCounts, Injected, StubExchange};
