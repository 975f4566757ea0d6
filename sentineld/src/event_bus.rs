//! Event bus for internal daemon communication.
//!
//! Watchers, the registry and the protection components publish what they
//! did; the daemon loop (and tests) subscribe. Nothing in the engine depends
//! on an event being received.
//!
//! Uses tokio broadcast channels for fan-out to multiple receivers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sentinel_domain::{BreakevenMethod, MonitorKey, Phase, Price, ProtectionStatus, Quantity};
use tokio::sync::broadcast;

use crate::fill_detector::OrderRole;

// =============================================================================
// Event Types
// =============================================================================

/// Events that flow through the daemon event bus.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// A monitor was registered
    MonitorCreated { key: MonitorKey, phase: Phase },

    /// A monitor was removed from the registry
    MonitorRemoved { key: MonitorKey, reason: String },

    /// Lifecycle phase moved forward
    PhaseChanged {
        key: MonitorKey,
        from: Phase,
        to: Phase,
        at: DateTime<Utc>,
    },

    /// An order was confirmed filled
    OrderFilled {
        key: MonitorKey,
        order_id: String,
        role: OrderRole,
        quantity: Quantity,
        confidence: Decimal,
    },

    /// The TP ladder and stop were resized
    Rebalanced {
        key: MonitorKey,
        size: Quantity,
        replaced: usize,
        failed: usize,
    },

    /// Stop moved to (or near) breakeven
    BreakevenApplied {
        key: MonitorKey,
        method: BreakevenMethod,
        price: Price,
    },

    /// Protection could not be established
    ProtectionFailed {
        key: MonitorKey,
        status: ProtectionStatus,
        detail: String,
    },

    /// Mirror monitor brought in line with the primary
    MirrorSynced { primary: MonitorKey, mirror: MonitorKey },

    /// Shutdown signal
    Shutdown,
}

// =============================================================================
// Event Bus
// =============================================================================

/// Event bus for daemon-wide communication.
///
/// Multiple producers can send events, and multiple consumers can receive.
/// Uses broadcast channels for fan-out pattern.
pub struct EventBus {
    sender: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity.
    ///
    /// Capacity determines how many events can be buffered before
    /// slow receivers start missing events (lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    /// Returns 0 if there are no active receivers.
    pub fn send(&self, event: DaemonEvent) -> usize {
        // send() returns Err if there are no receivers, but we don't care
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events.
    ///
    /// Returns a receiver that will receive all events sent after subscription.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Receiver for daemon events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<DaemonEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the sender has been dropped.
    /// Returns error description if the receiver lagged (missed events).
    pub async fn recv(&mut self) -> Option<Result<DaemonEvent, String>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Try to receive an event without blocking.
    ///
    /// Returns `None` if no event is immediately available.
    pub fn try_recv(&mut self) -> Option<Result<DaemonEvent, String>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Closed) => None,
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<DaemonEvent> {
        let mut out = Vec::new();
        while let Some(next) = self.try_recv() {
            if let Ok(event) = next {
                out.push(event);
            }
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
