//! LoopSync - Core Library
//!
//! Keeps every viewer of a looping audio/visual piece at the same point in
//! the loop. The server side is a shared loop clock plus a presence engine
//! (sessions, pointers, debounced activations); the client side estimates
//! latency and drift and asks for a resync when playback wanders.

pub mod client;
pub mod clock;
pub mod color;
pub mod debounce;
pub mod engine;
pub mod estimator;
pub mod latency;
pub mod registry;
pub mod sync;

// Re-exports for convenience
pub use client::{ClientHandle, ClientSession, Player, PresenceCallback, SharedEstimator};
pub use clock::{current_time_ms, LoopClock, LoopDuration, LoopPosition};
pub use engine::{spawn_heartbeat, EngineConfig, HeartbeatHandle, StatusReport, SyncEngine};
pub use estimator::{DriftCheck, DriftEstimator};
pub use registry::{PointerPosition, Session, ViewerId};
pub use sync::{ClientMessage, ServerMessage, SessionPhase};
