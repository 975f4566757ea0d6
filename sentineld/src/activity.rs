//! Liveness reporting for the health interface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Receives a heartbeat whenever a component completes a unit of work.
pub trait ActivityReporter: Send + Sync {
    fn record_activity(&self, source: &str);
}

/// Last-seen time per source.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    seen: Mutex<HashMap<String, Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// When `source` last reported, if ever
    pub fn last_seen(&self, source: &str) -> Option<Instant> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).get(source).copied()
    }

    /// Sources silent for longer than `max_age`, sorted
    pub fn stale_sources(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut stale: Vec<String> = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > max_age)
            .map(|(source, _)| source.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Forget a source (its monitor was removed)
    pub fn forget(&self, source: &str) {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).remove(source);
    }
}

impl ActivityReporter for ActivityTracker {
    fn record_activity(&self, source: &str) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.to_string(), Instant::now());
    }
}
