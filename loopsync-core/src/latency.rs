//! Latency tracking for drift estimation
//!
//! Measures round-trip time (RTT) to the server using ping/pong messages
//! and keeps a bounded window of one-way latency samples. The smoothed
//! estimate is the window median, so one delayed packet cannot drag it.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

/// Number of one-way samples kept in the window
pub const LATENCY_SAMPLE_COUNT: usize = 10;

/// Estimate used before any sample exists (ms)
const DEFAULT_LATENCY_MS: f64 = 10.0;

/// Pings with no answer after this long are forgotten (ms)
const PENDING_PING_TTL_MS: u64 = 10_000;

/// Tracks one-way latency to the server
#[derive(Debug, Default)]
pub struct LatencyTracker {
    /// Recent one-way samples in milliseconds, oldest first
    samples: VecDeque<f64>,
    /// Pings awaiting a pong: send timestamp -> local send time
    pending_pings: HashMap<u64, u64>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all samples and pending pings
    pub fn clear(&mut self) {
        self.samples.clear();
        self.pending_pings.clear();
    }

    /// Forget pending pings only (their pongs can no longer arrive)
    pub fn clear_pending(&mut self) {
        self.pending_pings.clear();
    }

    /// Register a ping sent at `now_ms`. Returns the timestamp to put in the Ping.
    pub fn create_ping(&mut self, now_ms: u64) -> u64 {
        self.pending_pings.insert(now_ms, now_ms);
        self.pending_pings
            .retain(|_, sent_at| now_ms.saturating_sub(*sent_at) < PENDING_PING_TTL_MS);
        now_ms
    }

    /// Handle a pong echoing `echoed_ms`. Returns the measured RTT if the
    /// pong answers a ping we are still waiting on.
    pub fn handle_pong(&mut self, echoed_ms: f64, now_ms: u64) -> Option<f64> {
        if !echoed_ms.is_finite() || echoed_ms < 0.0 {
            return None;
        }
        let sent_at = self.pending_pings.remove(&(echoed_ms.round() as u64))?;
        let rtt_ms = now_ms.saturating_sub(sent_at) as f64;
        self.add_sample(rtt_ms / 2.0);

        debug!(
            "Latency: RTT={}ms, one-way={:.1}ms, median={:.1}ms",
            rtt_ms,
            rtt_ms / 2.0,
            self.one_way_latency_ms()
        );
        Some(rtt_ms)
    }

    /// Record an opportunistic sample from a message stamped with the
    /// server's clock. Assumes roughly symmetric skew; the median bounds the
    /// damage when that does not hold.
    pub fn observe_server_time(&mut self, server_now_ms: u64, local_now_ms: u64) -> f64 {
        let sample = local_now_ms as f64 - server_now_ms as f64;
        self.add_sample(sample);
        sample.max(0.0)
    }

    /// Add a one-way sample, evicting the oldest when full
    pub fn add_sample(&mut self, one_way_ms: f64) {
        if !one_way_ms.is_finite() {
            return;
        }
        if self.samples.len() >= LATENCY_SAMPLE_COUNT {
            self.samples.pop_front();
        }
        self.samples.push_back(one_way_ms.max(0.0));
    }

    /// Median one-way latency in milliseconds
    pub fn one_way_latency_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return DEFAULT_LATENCY_MS;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_pings.len()
    }
}
