//! Debounced Event Gate
//!
//! Per-viewer rate limiter for the special activation event. A viewer's
//! duplicate presses inside the window are dropped without affecting any
//! other viewer, and accepted activations feed one process-wide counter.

use std::collections::HashMap;
use std::time::Duration;

use crate::registry::ViewerId;

/// Minimum spacing between two accepted activations from one viewer
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1000);

/// Result of an activation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Counted; carries the new process-wide total
    Accepted { total: u64 },
    /// Dropped, too soon after this viewer's previous activation
    Debounced,
}

/// Last-activation timestamps per viewer plus the global counter
#[derive(Debug)]
pub struct DebounceGate {
    window_ms: u64,
    last_activation: HashMap<ViewerId, u64>,
    total: u64,
}

impl DebounceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            last_activation: HashMap::new(),
            total: 0,
        }
    }

    /// Try to activate for `viewer` at `now_ms`
    pub fn activate(&mut self, viewer: &ViewerId, now_ms: u64) -> Activation {
        if let Some(&last) = self.last_activation.get(viewer) {
            if now_ms.saturating_sub(last) < self.window_ms {
                return Activation::Debounced;
            }
        }

        self.total += 1;
        self.last_activation.insert(viewer.clone(), now_ms);
        Activation::Accepted { total: self.total }
    }

    /// Drop a viewer's entry (called when its session closes)
    pub fn evict(&mut self, viewer: &ViewerId) -> bool {
        self.last_activation.remove(viewer).is_some()
    }

    /// Accepted activations across all viewers
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of viewers with a live entry
    pub fn tracked(&self) -> usize {
        self.last_activation.len()
    }
}

impl Default for DebounceGate {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}
