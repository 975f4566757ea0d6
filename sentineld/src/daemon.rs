//! Daemon: Main runtime orchestrator.
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Build the service context and the monitor registry
//! 3. Start the persistence writer
//! 4. Restore persisted monitors, then adopt unmonitored exchange positions
//! 5. Main event loop (log events, watch watcher liveness)
//! 6. Graceful shutdown on SIGINT or cancellation: watchers stop, orders stay
//!    on the exchange, records are flushed

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sentinel_exec::{ExchangeRouter, StubExchange};
use sentinel_store::{MemoryStore, MonitorRepository};

use crate::activity::ActivityTracker;
use crate::alerts::{AlertGateway, LogAlertGateway};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::DaemonEvent;
use crate::reconcile::reconcile_orphans;
use crate::registry::MonitorRegistry;
use crate::services::Services;

// =============================================================================
// Daemon
// =============================================================================

/// The TP/SL engine daemon.
pub struct Daemon {
    services: Arc<Services>,
    registry: Arc<MonitorRegistry>,
    activity: Arc<ActivityTracker>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a new daemon with stub components (for testing/development).
    ///
    /// A second stub backs the mirror account when mirroring is enabled.
    pub fn new_stub(config: Config) -> Self {
        let mut router = ExchangeRouter::new(Arc::new(StubExchange::new(rust_decimal_macros::dec!(95000))));
        if config.mirror_enabled {
            router = router.with_mirror(Arc::new(StubExchange::new(rust_decimal_macros::dec!(95000))));
        }
        Self::new(config, router, Arc::new(MemoryStore::new()), Arc::new(LogAlertGateway))
    }

    /// Create a new daemon with provided components.
    pub fn new(
        config: Config,
        router: ExchangeRouter,
        repo: Arc<dyn MonitorRepository>,
        alert_gateway: Arc<dyn AlertGateway>,
    ) -> Self {
        let activity = Arc::new(ActivityTracker::new());
        let services = Arc::new(Services::new(config, router, repo, alert_gateway, activity.clone()));
        let shutdown = CancellationToken::new();
        let registry = Arc::new(MonitorRegistry::new(Arc::clone(&services), shutdown.clone()));
        Self { services, registry, activity, shutdown }
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Watcher liveness, for a health endpoint
    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    /// Cancelling this token stops the daemon as SIGINT would
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Restore monitors and adopt orphans. Called by [`run`](Self::run).
    pub async fn start(&self) -> DaemonResult<()> {
        let restored = self.registry.restore_from_store().await?;
        let report = reconcile_orphans(&self.registry).await?;
        info!(restored, adopted = report.adopted, "Monitors started");
        Ok(())
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT or the
    /// shutdown token).
    pub async fn run(self) -> DaemonResult<()> {
        let config = &self.services.config;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %config.environment,
            mirror = config.mirror_enabled,
            "Starting sentinel daemon"
        );

        let writer = Arc::clone(&self.services.persistence).start(self.shutdown.child_token());
        self.start().await?;

        let mut events = self.services.bus.subscribe();
        let stale_after = config.polling.idle * 3;
        let mut health = interval(stale_after);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health.tick().await;

        info!("Entering main event loop");
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(event) {
                                if matches!(e, DaemonError::Shutdown) {
                                    break;
                                }
                                error!(error = %e, "Error handling event");
                            }
                        }
                        Err(lag_msg) => warn!(%lag_msg, "Event receiver lagged"),
                    }
                }
                _ = health.tick() => self.check_liveness(stale_after).await,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.shutdown().await;
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(DaemonError::Task(format!("persistence writer: {e}"))),
        }
    }

    fn handle_event(&self, event: DaemonEvent) -> DaemonResult<()> {
        match event {
            DaemonEvent::ProtectionFailed { key, status, detail } => {
                error!(%key, %status, %detail, "Protection failure reported");
            }
            DaemonEvent::PhaseChanged { key, from, to, .. } => {
                info!(%key, %from, %to, "Position phase changed");
            }
            DaemonEvent::MonitorRemoved { key, reason } => {
                self.activity.forget(&format!("watcher:{key}"));
                info!(%key, %reason, "Monitor removed");
            }
            DaemonEvent::Shutdown => {
                info!("Shutdown event received");
                return Err(DaemonError::Shutdown);
            }
            other => {
                debug!(event = ?other, "Daemon event");
            }
        }
        Ok(())
    }

    async fn check_liveness(&self, max_age: Duration) {
        let stale = self.activity.stale_sources(max_age);
        if !stale.is_empty() {
            warn!(sources = ?stale, "Watchers silent past their slowest poll interval");
        }
        let monitors = self.registry.len().await;
        info!(monitors, "Daemon heartbeat");
    }

    /// Graceful shutdown.
    async fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.registry.shutdown().await;
        self.shutdown.cancel();
        self.services.bus.send(DaemonEvent::Shutdown);
        info!("Shutdown complete");
    }
}

// =============================================================================
// Tests
// =============================================================================
