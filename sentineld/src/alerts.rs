//! Out-of-band alerts.
//!
//! Alerts are fire-and-forget: the dispatcher spawns the send and only logs
//! failures. Core logic never waits on an alert and never branches on its
//! outcome.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// =============================================================================
// Templates
// =============================================================================

/// Alert template selected by the engine; the gateway renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTemplate {
    MonitorOpened,
    TakeProfitFilled,
    StopLossFilled,
    BreakevenApplied,
    EmergencyProtection,
    CriticalProtectionFailure,
    PositionClosed,
}

impl AlertTemplate {
    /// Whether the alert needs a human right away
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AlertTemplate::CriticalProtectionFailure | AlertTemplate::EmergencyProtection
        )
    }
}

impl std::fmt::Display for AlertTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertTemplate::MonitorOpened => "monitor_opened",
            AlertTemplate::TakeProfitFilled => "take_profit_filled",
            AlertTemplate::StopLossFilled => "stop_loss_filled",
            AlertTemplate::BreakevenApplied => "breakeven_applied",
            AlertTemplate::EmergencyProtection => "emergency_protection",
            AlertTemplate::CriticalProtectionFailure => "critical_protection_failure",
            AlertTemplate::PositionClosed => "position_closed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Delivery channel for alerts (chat bot, pager, webhook).
#[async_trait]
pub trait AlertGateway: Send + Sync {
    /// Deliver one alert. Returns false when delivery failed.
    async fn send_alert(&self, target: &str, template: AlertTemplate, payload: serde_json::Value) -> bool;
}

/// Gateway that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertGateway;

#[async_trait]
impl AlertGateway for LogAlertGateway {
    async fn send_alert(&self, target: &str, template: AlertTemplate, payload: serde_json::Value) -> bool {
        if template.is_critical() {
            warn!(target_channel = target, %template, %payload, "ALERT");
        } else {
            info!(target_channel = target, %template, %payload, "Alert");
        }
        true
    }
}

/// A delivered alert, as recorded by [`MemoryAlertGateway`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentAlert {
    pub target: String,
    pub template: AlertTemplate,
    pub payload: serde_json::Value,
}

/// Recording gateway for tests.
#[derive(Debug, Default)]
pub struct MemoryAlertGateway {
    sent: Mutex<Vec<SentAlert>>,
    fail: Mutex<bool>,
}

impl MemoryAlertGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery report failure
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Everything delivered so far
    pub fn sent(&self) -> Vec<SentAlert> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Delivered alerts of one template
    pub fn count(&self, template: AlertTemplate) -> usize {
        self.sent().iter().filter(|a| a.template == template).count()
    }

    /// Wait until at least one alert of `template` arrived, up to `timeout`.
    pub async fn wait_for(&self, template: AlertTemplate, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count(template) > 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl AlertGateway for MemoryAlertGateway {
    async fn send_alert(&self, target: &str, template: AlertTemplate, payload: serde_json::Value) -> bool {
        if *self.fail.lock().unwrap_or_else(|e| e.into_inner()) {
            return false;
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(SentAlert {
            target: target.to_string(),
            template,
            payload,
        });
        true
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Spawns alert deliveries so callers never wait on them.
#[derive(Clone)]
pub struct AlertDispatcher {
    gateway: Arc<dyn AlertGateway>,
}

impl AlertDispatcher {
    pub fn new(gateway: Arc<dyn AlertGateway>) -> Self {
        Self { gateway }
    }

    /// Send in the background. Failures are logged and otherwise ignored.
    pub fn dispatch(&self, target: &str, template: AlertTemplate, mut payload: serde_json::Value) {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("alert_id".into(), uuid::Uuid::now_v7().to_string().into());
        }
        let gateway = Arc::clone(&self.gateway);
        let target = target.to_string();
        tokio::spawn(async move {
            if gateway.send_alert(&target, template, payload).await {
                debug!(target_channel = %target, %template, "Alert delivered");
            } else {
                warn!(target_channel = %target, %template, "Alert delivery failed");
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch_delivers_in_background() {
        let gateway = Arc::new(MemoryAlertGateway::new());
        let dispatcher = AlertDispatcher::new(gateway.clone());

        dispatcher.dispatch("ops", AlertTemplate::BreakevenApplied, json!({ "key": "BTCUSDT:long:main" }));

        assert!(gateway.wait_for(AlertTemplate::BreakevenApplied, Duration::from_secs(1)).await);
        let sent = gateway.sent();
        assert_eq!(sent[0].target, "ops");
        assert_eq!(sent[0].payload["key"], "BTCUSDT:long:main");
        assert!(sent[0].payload.get("alert_id").is_some());
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_propagate() {
        let gateway = Arc::new(MemoryAlertGateway::new());
        gateway.set_failing(true);
        let dispatcher = AlertDispatcher::new(gateway.clone());

        dispatcher.dispatch("ops", AlertTemplate::PositionClosed, json!({}));

        assert!(!gateway.wait_for(AlertTemplate::PositionClosed, Duration::from_millis(50)).await);
    }

    #[test]
    fn test_template_names() {
        assert_eq!(AlertTemplate::CriticalProtectionFailure.to_string(), "critical_protection_failure");
        assert!(AlertTemplate::CriticalProtectionFailure.is_critical());
        assert!(!AlertTemplate::TakeProfitFilled.is_critical());
    }
}
