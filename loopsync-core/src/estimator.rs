//! Client Sync Estimator
//!
//! Everything a viewer computes locally to stay in phase with the server:
//! the smoothed latency, the expected timeline position, and the decision of
//! when to ask for a hard resync.
//!
//! The expected position uses the viewer's own media duration once the
//! player reports it, since the server's nominal duration may differ
//! slightly from the real asset length.

use std::time::Duration;

use tracing::{debug, info};

use crate::clock::{split_elapsed, LoopDuration, LoopPosition};
use crate::latency::LatencyTracker;
use crate::registry::ViewerId;
use crate::sync::{HeartbeatInfo, PresenceSnapshot};

/// Drift above this triggers a resync
pub const DRIFT_THRESHOLD: Duration = Duration::from_millis(150);

/// Minimum spacing between two corrections
pub const CORRECTION_COOLDOWN: Duration = Duration::from_secs(3);

/// Where the estimator is in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorPhase {
    /// Connected (or reconnected); waiting for a Sync before checking drift
    AwaitingSync,
    /// Synced; every heartbeat is checked
    Tracking,
    /// Transport is down; nothing is adjusted
    Frozen,
}

/// Why a drift check did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Frozen,
    AwaitingSync,
    /// Heartbeat carried unusable values
    InvalidHeartbeat,
    /// Player could not report where it is
    NoPlaybackPosition,
}

/// Result of checking one heartbeat
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftCheck {
    Skipped(SkipReason),
    /// Within threshold
    InSync { drift_secs: f64 },
    /// Over threshold but a correction happened too recently
    CoolingDown { drift_secs: f64 },
    /// Over threshold; caller should request a resync
    Resync { drift_secs: f64 },
}

/// Distance between two loop offsets, accounting for the wrap at the loop
/// boundary (20.9s and 0.2s in a 21s loop are 0.3s apart).
pub fn adjusted_drift(expected_secs: f64, actual_secs: f64, duration_secs: f64) -> f64 {
    let drift = (expected_secs - actual_secs).abs() % duration_secs;
    drift.min(duration_secs - drift)
}

/// Local drift estimator for one viewer
#[derive(Debug)]
pub struct DriftEstimator {
    phase: EstimatorPhase,
    epoch_ms: Option<u64>,
    nominal_duration: Option<LoopDuration>,
    /// Exact asset duration reported by the local player
    local_duration: Option<LoopDuration>,
    latency: LatencyTracker,
    last_correction_ms: Option<u64>,
    threshold_secs: f64,
    cooldown_ms: u64,
    viewer: Option<(ViewerId, String)>,
}

impl DriftEstimator {
    pub fn new() -> Self {
        Self::with_policy(DRIFT_THRESHOLD, CORRECTION_COOLDOWN)
    }

    pub fn with_policy(threshold: Duration, cooldown: Duration) -> Self {
        Self {
            phase: EstimatorPhase::AwaitingSync,
            epoch_ms: None,
            nominal_duration: None,
            local_duration: None,
            latency: LatencyTracker::new(),
            last_correction_ms: None,
            threshold_secs: threshold.as_secs_f64(),
            cooldown_ms: cooldown.as_millis() as u64,
            viewer: None,
        }
    }

    pub fn phase(&self) -> EstimatorPhase {
        self.phase
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn latency_mut(&mut self) -> &mut LatencyTracker {
        &mut self.latency
    }

    /// Our own id and color, once the server has told us
    pub fn viewer(&self) -> Option<(&ViewerId, &str)> {
        self.viewer.as_ref().map(|(id, color)| (id, color.as_str()))
    }

    /// Refine the loop duration with the asset's exact length
    pub fn set_local_duration(&mut self, secs: f64) -> bool {
        match LoopDuration::from_secs(secs) {
            Ok(duration) => {
                if self.local_duration != Some(duration) {
                    debug!("Using local media duration {:.3}s", secs);
                }
                self.local_duration = Some(duration);
                true
            }
            Err(err) => {
                debug!("Ignoring local duration: {}", err);
                false
            }
        }
    }

    /// Duration used for position math: local if known, else nominal
    pub fn effective_duration(&self) -> Option<f64> {
        self.local_duration
            .or(self.nominal_duration)
            .map(|d| d.as_secs())
    }

    /// Adopt a Sync payload. Returns where playback should start, or None
    /// if the payload was unusable (the estimator keeps its previous state).
    pub fn apply_sync(&mut self, snapshot: &PresenceSnapshot, local_now_ms: u64) -> Option<LoopPosition> {
        if self.phase == EstimatorPhase::Frozen {
            debug!("Ignoring sync while frozen");
            return None;
        }
        let nominal = match LoopDuration::from_secs(snapshot.loop_duration) {
            Ok(duration) => duration,
            Err(err) => {
                debug!("Ignoring sync: {}", err);
                return None;
            }
        };

        self.epoch_ms = Some(snapshot.epoch);
        self.nominal_duration = Some(nominal);
        self.viewer = Some((snapshot.viewer_id.clone(), snapshot.viewer_color.clone()));
        self.latency.observe_server_time(snapshot.server_now, local_now_ms);
        self.phase = EstimatorPhase::Tracking;

        self.expected_at(local_now_ms)
    }

    /// Expected timeline position at `local_now_ms`
    pub fn expected_at(&self, local_now_ms: u64) -> Option<LoopPosition> {
        let epoch_ms = self.epoch_ms?;
        let duration = self.effective_duration()?;
        let elapsed_ms = local_now_ms as f64 - epoch_ms as f64 + self.latency.one_way_latency_ms();
        Some(split_elapsed(elapsed_ms / 1000.0, duration))
    }

    /// Compare a heartbeat's implied position against the player's actual one
    pub fn check_heartbeat(
        &mut self,
        heartbeat: &HeartbeatInfo,
        local_now_ms: u64,
        actual_secs: Option<f64>,
    ) -> DriftCheck {
        match self.phase {
            EstimatorPhase::Frozen => return DriftCheck::Skipped(SkipReason::Frozen),
            EstimatorPhase::AwaitingSync => return DriftCheck::Skipped(SkipReason::AwaitingSync),
            EstimatorPhase::Tracking => {}
        }

        if !heartbeat.position.is_finite() || heartbeat.server_now < heartbeat.epoch {
            return DriftCheck::Skipped(SkipReason::InvalidHeartbeat);
        }

        self.latency.observe_server_time(heartbeat.server_now, local_now_ms);
        self.epoch_ms = Some(heartbeat.epoch);

        let actual = match actual_secs {
            Some(actual) if actual.is_finite() && actual >= 0.0 => actual,
            _ => return DriftCheck::Skipped(SkipReason::NoPlaybackPosition),
        };
        let (expected, duration) = match (self.expected_at(local_now_ms), self.effective_duration()) {
            (Some(expected), Some(duration)) => (expected, duration),
            _ => return DriftCheck::Skipped(SkipReason::AwaitingSync),
        };

        let drift_secs = adjusted_drift(expected.position, actual, duration);
        if drift_secs <= self.threshold_secs {
            return DriftCheck::InSync { drift_secs };
        }

        let cooled_down = self
            .last_correction_ms
            .map(|last| local_now_ms.saturating_sub(last) >= self.cooldown_ms)
            .unwrap_or(true);
        if !cooled_down {
            debug!("Drift {:.0}ms over threshold, cooling down", drift_secs * 1000.0);
            return DriftCheck::CoolingDown { drift_secs };
        }

        info!(
            "Drift {:.0}ms (expected {:.3}s, actual {:.3}s), requesting resync",
            drift_secs * 1000.0,
            expected.position,
            actual
        );
        self.last_correction_ms = Some(local_now_ms);
        DriftCheck::Resync { drift_secs }
    }

    /// Whether `actual_secs` is already within the drift threshold of
    /// `expected_secs`. False while no duration is known.
    pub fn within_threshold(&self, expected_secs: f64, actual_secs: f64) -> bool {
        match self.effective_duration() {
            Some(duration) if actual_secs.is_finite() => {
                adjusted_drift(expected_secs, actual_secs, duration) <= self.threshold_secs
            }
            _ => false,
        }
    }

    /// Feed a pong back into the latency window
    pub fn record_pong(&mut self, echoed_ms: f64, local_now_ms: u64) -> Option<f64> {
        self.latency.handle_pong(echoed_ms, local_now_ms)
    }

    /// Stop adjusting (transport disconnected)
    pub fn freeze(&mut self) {
        if self.phase != EstimatorPhase::Frozen {
            info!("Sync estimator frozen");
        }
        self.phase = EstimatorPhase::Frozen;
        self.latency.clear_pending();
    }

    /// Transport is back; wait for a fresh Sync before checking drift
    pub fn resume(&mut self) {
        self.phase = EstimatorPhase::AwaitingSync;
    }
}

impl Default for DriftEstimator {
    fn default() -> Self {
        Self::new()
    }
}
