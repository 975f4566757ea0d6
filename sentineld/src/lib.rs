//! Sentinel Daemon Library
//!
//! Take-profit / stop-loss engine for leveraged positions.
//!
//! # Architecture
//!
//! ```text
//!                     MonitorRegistry (creation lock)
//!                            │ one watcher task per position
//!                            ▼
//!   ExchangeStateCache ─▶ PositionWatcher ─▶ FillDetector
//!                            │
//!          ┌─────────────────┼──────────────────┐
//!          ▼                 ▼                  ▼
//!   PhaseStateMachine  OrderRebalancer  BreakevenCascade ─▶ MirrorCoordinator
//!          │                 │                  │
//!          └──── ConcurrencyGuard (per-position locks) ────┘
//!                            │
//!                  ExchangeRouter (primary / mirror)
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **MonitorRegistry**: One monitor per (symbol, side, account) plus its watcher
//! - **PositionWatcher**: Adaptive polling loop with a circuit breaker
//! - **FillDetector**: Multi-signal fill confirmation
//! - **PhaseStateMachine**: BUILDING → PROFIT_TAKING → CLOSED
//! - **OrderRebalancer**: TP ladder and stop resizing
//! - **BreakevenCascade**: Four-layer stop-to-breakeven with verification
//! - **MirrorCoordinator**: Mirror account follows the primary at its own size
//! - **ExchangeStateCache**: Whole-account snapshots shared by all watchers
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use sentineld::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new_stub(config);
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod activity;
pub mod alerts;
pub mod breakeven;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event_bus;
pub mod fill_detector;
pub mod guard;
pub mod mirror;
pub mod persistence;
pub mod phase;
pub mod polling;
pub mod rebalancer;
pub mod reconcile;
pub mod registry;
pub mod services;
pub mod watcher;

// Re-exports for convenience
pub use activity::{ActivityReporter, ActivityTracker};
pub use alerts::{AlertDispatcher, AlertGateway, AlertTemplate, LogAlertGateway, MemoryAlertGateway};
pub use breakeven::{BreakevenCascade, BreakevenOutcome};
pub use cache::{AccountSnapshot, ExchangeStateCache};
pub use config::{Config, Environment};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use event_bus::{DaemonEvent, EventBus, EventReceiver};
pub use fill_detector::{FillDetector, FillReport, OrderRole};
pub use guard::ConcurrencyGuard;
pub use mirror::{MirrorCoordinator, MirrorSync};
pub use phase::PhaseStateMachine;
pub use rebalancer::{OrderRebalancer, RebalanceReport, StopResize};
pub use reconcile::{reconcile_orphans, ReconcileReport};
pub use registry::{MonitorEntry, MonitorRegistry, OpenPositionRequest};
pub use services::Services;
pub use watcher::{PositionWatcher, TickOutcome};
