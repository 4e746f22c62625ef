//! Presence State Management

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::protocol::{PresenceSnapshot, ServerMessage};
use crate::clock::LoopClock;
use crate::debounce::DebounceGate;
use crate::registry::{SessionRegistry, ViewerId};

/// Messages buffered for one viewer before new ones are dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Queue feeding one viewer's transport writer
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Create a viewer queue with the standard capacity
pub fn outbound_channel() -> (Outbound, mpsc::Receiver<ServerMessage>) {
    mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
}

/// Enqueue without waiting. A full queue means the viewer stopped reading;
/// the message is dropped and the next heartbeat or sync supersedes it.
fn offer(id: &ViewerId, tx: &Outbound, message: ServerMessage) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            debug!("Queue full for {}, dropped {}", id, message.kind());
            false
        }
        Err(TrySendError::Closed(message)) => {
            debug!("Dropped {} for closing session {}", message.kind(), id);
            false
        }
    }
}

/// Lifecycle of one viewer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Transport accepted, not yet registered
    Connecting,
    /// Registered and receiving broadcasts
    Active,
    /// Transport gone; terminal
    Closed,
}

impl SessionPhase {
    /// Move to `Active`. Only valid from `Connecting`.
    pub fn activate(&mut self) -> bool {
        if *self == SessionPhase::Connecting {
            *self = SessionPhase::Active;
            true
        } else {
            false
        }
    }

    /// Move to `Closed` from any phase
    pub fn close(&mut self) {
        *self = SessionPhase::Closed;
    }

    /// Whether client messages should be handed to the engine
    pub fn accepts_messages(&self) -> bool {
        *self == SessionPhase::Active
    }
}

/// Everything the server mutates: registry, debounce map, activation
/// counter and the per-viewer outbound queues. Kept behind one lock.
#[derive(Debug)]
pub struct PresenceState {
    pub registry: SessionRegistry,
    pub gate: DebounceGate,
    outbound: HashMap<ViewerId, Outbound>,
}

impl PresenceState {
    pub fn new(debounce_window: Duration) -> Self {
        Self {
            registry: SessionRegistry::new(),
            gate: DebounceGate::new(debounce_window),
            outbound: HashMap::new(),
        }
    }

    /// Attach a viewer's outbound queue
    pub fn attach(&mut self, id: ViewerId, outbound: Outbound) {
        self.outbound.insert(id, outbound);
    }

    /// Drop a viewer's outbound queue; its writer drains and stops
    pub fn detach(&mut self, id: &ViewerId) -> bool {
        self.outbound.remove(id).is_some()
    }

    /// Send to a single viewer. Returns false if it has no live queue.
    pub fn send_to(&self, id: &ViewerId, message: ServerMessage) -> bool {
        match self.outbound.get(id) {
            Some(tx) => offer(id, tx, message),
            None => false,
        }
    }

    /// Send to every attached viewer except `except`; returns recipient count.
    ///
    /// Delivery is best effort: closed or full queues are skipped.
    pub fn broadcast(&self, message: &ServerMessage, except: Option<&ViewerId>) -> usize {
        let mut delivered = 0;
        for (id, tx) in &self.outbound {
            if Some(id) == except {
                continue;
            }
            if offer(id, tx, message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Build a fresh snapshot for `id`, or None if it is not registered
    pub fn snapshot_for(&self, id: &ViewerId, clock: &LoopClock, now_ms: u64) -> Option<PresenceSnapshot> {
        let viewer = self.registry.get(id)?;
        let (all_sessions, session_count) = self.registry.snapshot();
        let at = clock.at(now_ms);

        Some(PresenceSnapshot {
            epoch: clock.epoch_ms(),
            server_now: now_ms,
            loop_duration: clock.duration().as_secs(),
            position: at.position,
            loop_count: at.loop_count,
            viewer_id: viewer.id.clone(),
            viewer_color: viewer.color.clone(),
            all_sessions,
            session_count,
        })
    }

    /// Number of attached outbound queues
    pub fn attached(&self) -> usize {
        self.outbound.len()
    }
}
