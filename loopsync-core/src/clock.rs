//! Clock Authority
//!
//! The single source of truth for loop position. Every timeline value the
//! server hands out is derived from one fixed epoch and one fixed loop
//! duration, so there is nothing to mutate and nothing that can fail once
//! the duration has been validated at startup.

use thiserror::Error;

/// Errors raised while validating clock configuration
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum ClockError {
    #[error("Loop duration must be a finite number of seconds greater than zero (got {0})")]
    InvalidDuration(f64),
}

/// Nominal loop duration in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopDuration(f64);

impl LoopDuration {
    /// Validate a duration given in seconds
    pub fn from_secs(secs: f64) -> Result<Self, ClockError> {
        if secs.is_finite() && secs > 0.0 {
            Ok(Self(secs))
        } else {
            Err(ClockError::InvalidDuration(secs))
        }
    }

    pub fn as_secs(&self) -> f64 {
        self.0
    }
}

/// Offset into the loop plus the number of completed repetitions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopPosition {
    /// Seconds into the current repetition, always in `[0, duration)`
    pub position: f64,
    /// Completed repetitions since the epoch
    pub loop_count: u64,
}

/// Fixed epoch + fixed duration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopClock {
    epoch_ms: u64,
    duration: LoopDuration,
}

impl LoopClock {
    pub fn new(epoch_ms: u64, duration: LoopDuration) -> Self {
        Self { epoch_ms, duration }
    }

    /// Create a clock whose epoch is the current wall-clock time
    pub fn starting_now(duration: LoopDuration) -> Self {
        Self::new(current_time_ms(), duration)
    }

    /// Epoch in milliseconds since UNIX epoch
    pub fn epoch_ms(&self) -> u64 {
        self.epoch_ms
    }

    pub fn duration(&self) -> LoopDuration {
        self.duration
    }

    /// Milliseconds since the epoch (zero for instants before it)
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.epoch_ms)
    }

    /// Seconds into the current repetition
    pub fn position(&self, now_ms: u64) -> f64 {
        self.at(now_ms).position
    }

    /// Completed repetitions at `now_ms`
    pub fn loop_count(&self, now_ms: u64) -> u64 {
        self.at(now_ms).loop_count
    }

    /// Position and loop count computed together so they always agree
    pub fn at(&self, now_ms: u64) -> LoopPosition {
        let elapsed = self.elapsed_ms(now_ms) as f64 / 1000.0;
        split_elapsed(elapsed, self.duration.as_secs())
    }
}

/// Split elapsed seconds into an in-loop offset and a repetition count.
///
/// Negative input (a viewer whose clock runs behind the epoch) maps to
/// repetition zero with the offset still wrapped into `[0, duration)`.
pub fn split_elapsed(elapsed_secs: f64, duration_secs: f64) -> LoopPosition {
    let position = wrap_position(elapsed_secs, duration_secs);
    // Derive the count from the same remainder so a float rounding in the
    // division can never disagree with the wrapped offset.
    let loops = ((elapsed_secs - position) / duration_secs).round();
    LoopPosition {
        position,
        loop_count: if loops > 0.0 { loops as u64 } else { 0 },
    }
}

/// Wrap seconds into `[0, duration)`
pub fn wrap_position(secs: f64, duration_secs: f64) -> f64 {
    let wrapped = secs.rem_euclid(duration_secs);
    if wrapped >= duration_secs {
        0.0
    } else {
        wrapped
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
