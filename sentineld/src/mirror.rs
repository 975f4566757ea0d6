//! Mirror account coordination.
//!
//! The mirror account replicates the primary's trades at its own size. When
//! the primary monitor hits TP1 or moves its stop to breakeven, the paired
//! mirror monitor follows: its phase is advanced and its stop is moved by the
//! breakeven cascade computed from the mirror's own entry price and exposure.
//!
//! Only the mirror position's locks are taken. The primary's state arrives as
//! a record snapshot, so the primary's locks are never needed here.

use std::sync::Arc;

use tracing::{debug, info, warn};

use sentinel_domain::{Account, Phase, PhaseChange, PositionMonitor};

use crate::breakeven::{BreakevenCascade, BreakevenOutcome};
use crate::error::DaemonResult;
use crate::event_bus::{DaemonEvent, EventBus};
use crate::persistence::PersistenceWriter;
use crate::phase::PhaseStateMachine;
use crate::registry::MonitorRegistry;

/// What one sync did to the mirror monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSync {
    pub phase: PhaseChange,
    pub breakeven: Option<BreakevenOutcome>,
}

pub struct MirrorCoordinator {
    phases: Arc<PhaseStateMachine>,
    cascade: Arc<BreakevenCascade>,
    persistence: Arc<PersistenceWriter>,
    bus: Arc<EventBus>,
}

impl MirrorCoordinator {
    pub fn new(
        phases: Arc<PhaseStateMachine>,
        cascade: Arc<BreakevenCascade>,
        persistence: Arc<PersistenceWriter>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { phases, cascade, persistence, bus }
    }

    /// Bring the mirror of `primary` up to the primary's progress.
    ///
    /// Returns `None` when `primary` is not a primary-account record or has
    /// no mirror monitor.
    ///
    /// # Errors
    /// Propagates phase and cascade errors of the mirror position.
    pub async fn sync_from_primary(
        &self,
        registry: &MonitorRegistry,
        primary: &PositionMonitor,
    ) -> DaemonResult<Option<MirrorSync>> {
        if primary.account != Account::Primary {
            return Ok(None);
        }
        let primary_key = primary.key();
        let mirror_key = primary_key.counterpart();
        let Some(mirror) = registry.get(&mirror_key).await else {
            debug!(key = %primary_key, "No mirror monitor to sync");
            return Ok(None);
        };

        let phase = if primary.tp1_hit {
            self.phases.transition(&mirror, Phase::ProfitTaking).await?
        } else {
            PhaseChange::Unchanged
        };
        if let PhaseChange::Advanced { .. } = phase {
            if let Err(e) = self.persistence.save_now(&mirror.snapshot()).await {
                warn!(key = %mirror_key, error = %e, "Mirror phase change not persisted yet");
            }
        }

        let record = mirror.snapshot();
        let breakeven = if primary.sl_moved_to_breakeven && record.tp1_hit && !record.sl_moved_to_breakeven {
            Some(self.cascade.apply(&mirror).await?)
        } else {
            None
        };

        if phase != PhaseChange::Unchanged || breakeven.is_some() {
            info!(
                primary = %primary_key,
                mirror = %mirror_key,
                ?phase,
                ?breakeven,
                size = %record.remaining_size,
                "Mirror synced"
            );
            self.bus.send(DaemonEvent::MirrorSynced {
                primary: primary_key,
                mirror: mirror_key,
            });
        }

        Ok(Some(MirrorSync { phase, breakeven }))
    }
}
