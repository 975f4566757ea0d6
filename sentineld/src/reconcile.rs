//! Startup reconciliation.
//!
//! After persisted monitors are restored, every open exchange position on
//! every account that still has no monitor is adopted: its resting orders
//! are rebuilt into a record, a safety stop is placed when none exists, and
//! a watcher is started. Registration goes through the creation lock, so a
//! position opened live while this runs is never adopted twice.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use sentinel_domain::{MonitorKey, ObservedOrder, OrphanPosition};
use sentinel_exec::cancel_lenient;

use crate::alerts::AlertTemplate;
use crate::error::{DaemonError, DaemonResult};
use crate::registry::MonitorRegistry;

/// Counts from one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: usize,
    pub safety_stops: usize,
    /// Positions that were already monitored
    pub skipped: usize,
}

/// Adopt every unmonitored open position.
///
/// # Errors
/// Snapshot reads propagate; a single position that fails to adopt is
/// logged and skipped.
pub async fn reconcile_orphans(registry: &Arc<MonitorRegistry>) -> DaemonResult<ReconcileReport> {
    let services = Arc::clone(registry.services());
    let mut report = ReconcileReport::default();

    for account in services.router.accounts() {
        let snapshot = services.cache.snapshot(account).await?;
        let exchange = services.router.for_account(account)?;

        for position in snapshot.positions.iter().filter(|p| !p.size.is_zero()) {
            let key = MonitorKey::new(position.symbol.clone(), position.side, account);
            if registry.contains(&key).await {
                report.skipped += 1;
                continue;
            }

            let orders: Vec<ObservedOrder> = snapshot
                .orders_for(&position.symbol, position.side)
                .into_iter()
                .filter_map(|o| o.observe())
                .collect();
            let orphan = OrphanPosition::new(key.clone(), position.entry_price, position.size);
            let mut adoption = orphan.adopt(&orders, &services.config.ladder, &services.config.alert_target);
            adoption.monitor.last_realized_pnl = position.realized_pnl;

            warn!(
                %key,
                size = %position.size,
                entry = %position.entry_price,
                orders = orders.len(),
                phase = %adoption.monitor.phase,
                "Adopting unmonitored position"
            );

            let entry = match registry.insert(adoption.monitor).await {
                Ok(entry) => entry,
                Err(DaemonError::AlreadyMonitored(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Adoption failed");
                    continue;
                }
            };

            if adoption.needs_safety_stop {
                match services.rebalancer.resize_stop(&entry).await {
                    Ok(resize) => {
                        let price = entry.snapshot().sl_order.map(|sl| sl.trigger_price);
                        info!(%key, ?resize, ?price, "No stop found, safety stop placed");
                        report.safety_stops += 1;
                    }
                    Err(e) => warn!(%key, error = %e, "Safety stop not placed, watcher will retry"),
                }
            }

            for order_id in &adoption.stale_entry_legs {
                if let Err(e) = cancel_lenient(exchange.as_ref(), &services.config.retry, &key.symbol, order_id).await {
                    warn!(%key, %order_id, error = %e, "Stale entry leg not cancelled");
                }
            }

            services.alerts.dispatch(
                &services.config.alert_target,
                AlertTemplate::MonitorOpened,
                json!({
                    "key": key.to_string(),
                    "adopted": true,
                    "size": position.size.to_string(),
                    "entry_price": position.entry_price.to_string(),
                }),
            );
            registry.spawn_watcher(&entry);
            report.adopted += 1;
        }
    }

    info!(
        adopted = report.adopted,
        safety_stops = report.safety_stops,
        skipped = report.skipped,
        "Reconciliation complete"
    );
    Ok(report)
}
