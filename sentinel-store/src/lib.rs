//! Sentinel Storage Layer
//!
//! Persistence gateway for monitor records.
//!
//! # Architecture
//!
//! - **Repository trait**: the storage interface (port)
//! - **In-memory store**: JSON-serialising implementation for tests and the stub daemon
//!
//! Durability is eventual: the daemon batches saves and only forces a write
//! on critical events.
//!
//! # Usage
//!
//! ```rust
//! use sentinel_store::{MemoryStore, MonitorRepository};
//! use sentinel_domain::{Account, MonitorKey, PositionMonitor, Price, Quantity, Side, Symbol};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let key = MonitorKey::new(Symbol::from_pair("BTCUSDT").unwrap(), Side::Long, Account::Primary);
//!     let record = PositionMonitor::new(
//!         &key,
//!         Price::new(Decimal::from(100)).unwrap(),
//!         Quantity::new(Decimal::from(1)).unwrap(),
//!         "ops",
//!     );
//!
//!     store.save(&key, &record).await.unwrap();
//!     assert_eq!(store.load_all().await.unwrap().len(), 1);
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::MemoryStore;
pub use repository::MonitorRepository;
