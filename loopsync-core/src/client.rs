//! Client session driver
//!
//! Runs one viewer's side of the protocol over a pair of channels: pings on a
//! timer, reacts to server messages, asks for a resync when the estimator
//! says playback has drifted. The transport (websocket, test harness) only
//! has to move `ClientMessage`s out and `ServerMessage`s in.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::current_time_ms;
use crate::estimator::{DriftCheck, DriftEstimator, EstimatorPhase};
use crate::registry::{PointerPosition, Session, ViewerId};
use crate::sync::{ClientMessage, PresenceSnapshot, ServerMessage};

/// Interval between latency pings
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Estimator shared between the driver task and the application.
/// Survives reconnects so the latency window is kept.
pub type SharedEstimator = Arc<Mutex<DriftEstimator>>;

pub fn new_shared_estimator() -> SharedEstimator {
    Arc::new(Mutex::new(DriftEstimator::new()))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not connected to the sync server")]
    Disconnected,
}

/// Local media playback, implemented by the application
pub trait Player: Send + Sync {
    /// Current offset into the asset in seconds, if known
    fn playback_position(&self) -> Option<f64>;

    /// Exact asset length in seconds, if known
    fn media_duration(&self) -> Option<f64>;

    /// Restart playback from `position_secs` in repetition `loop_count`
    fn start_at(&self, position_secs: f64, loop_count: u64);
}

/// Presence notifications. Every method defaults to doing nothing.
pub trait PresenceCallback: Send + Sync {
    fn on_synced(&self, _snapshot: &PresenceSnapshot) {}
    fn on_session_joined(&self, _session: &Session, _session_count: usize) {}
    fn on_session_left(&self, _viewer_id: &ViewerId, _session_count: usize) {}
    fn on_position_updated(&self, _viewer_id: &ViewerId, _pointer: PointerPosition) {}
    fn on_activation_result(&self, _total_count: u64) {}
    fn on_drift_checked(&self, _check: DriftCheck) {}
    fn on_disconnected(&self) {}
}

/// Handle to a running client session
pub struct ClientHandle {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Report our pointer; coordinates are clamped into `[0, 1]`
    pub fn update_position(&self, x: f64, y: f64) -> Result<(), ClientError> {
        let pointer = PointerPosition::clamped(x, y);
        self.send(ClientMessage::UpdatePosition {
            x: pointer.x,
            y: pointer.y,
        })
    }

    pub fn activate(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Activate)
    }

    pub fn request_sync(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::RequestSync)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop timers and wait for the driver to finish
    pub async fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }

    /// Wait for the driver to end on its own (inbound closed)
    pub async fn closed(self) {
        let _ = self.task.await;
    }

    fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.outbound
            .send(message)
            .map_err(|_| ClientError::Disconnected)
    }
}

pub struct ClientSession;

impl ClientSession {
    /// Start driving a connection. Reusing an estimator from an earlier
    /// connection counts as a reconnect: a `RequestSync` goes out first.
    pub fn spawn(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        mut inbound: mpsc::Receiver<ServerMessage>,
        estimator: SharedEstimator,
        player: Arc<dyn Player>,
        callback: Arc<dyn PresenceCallback>,
    ) -> ClientHandle {
        let reconnect = {
            let mut est = estimator.lock();
            let seen_before = est.phase() == EstimatorPhase::Frozen || est.viewer().is_some();
            est.resume();
            seen_before
        };
        if reconnect {
            info!("Reconnected, requesting sync");
            let _ = outbound.send(ClientMessage::RequestSync);
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let driver = Driver {
            outbound: outbound.clone(),
            estimator,
            player,
            callback,
        };

        let task = tokio::spawn(async move {
            debug!("Client session started");
            let mut ping_timer = tokio::time::interval(PING_INTERVAL);
            ping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("Client session cancelled");
                        break;
                    }
                    _ = ping_timer.tick() => {
                        if !driver.send_ping() {
                            break;
                        }
                    }
                    message = inbound.recv() => match message {
                        Some(message) => driver.handle(message),
                        None => {
                            info!("Connection to sync server closed");
                            break;
                        }
                    }
                }
            }

            driver.estimator.lock().freeze();
            driver.callback.on_disconnected();
            debug!("Client session ended");
        });

        ClientHandle {
            outbound,
            cancel: Some(cancel_tx),
            task,
        }
    }
}

struct Driver {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    estimator: SharedEstimator,
    player: Arc<dyn Player>,
    callback: Arc<dyn PresenceCallback>,
}

impl Driver {
    fn send_ping(&self) -> bool {
        let sent_at = self.estimator.lock().latency_mut().create_ping(current_time_ms());
        self.outbound
            .send(ClientMessage::Ping {
                client_send_time: sent_at as f64,
            })
            .is_ok()
    }

    fn handle(&self, message: ServerMessage) {
        let now = current_time_ms();
        match message {
            ServerMessage::Sync(snapshot) => {
                let media_duration = self.player.media_duration();
                let actual = self.player.playback_position();
                let (start, in_phase) = {
                    let mut est = self.estimator.lock();
                    if let Some(secs) = media_duration {
                        est.set_local_duration(secs);
                    }
                    let start = est.apply_sync(&snapshot, now);
                    let in_phase = match (start, actual) {
                        (Some(start), Some(actual)) => est.within_threshold(start.position, actual),
                        _ => false,
                    };
                    (start, in_phase)
                };
                match start {
                    // A reconnect gets the connect-time Sync and the requested one
                    // back to back; the second must not restart playback again.
                    Some(start) if in_phase => {
                        debug!("Synced as {}: already in phase at {:.3}s", snapshot.viewer_id, start.position);
                        self.callback.on_synced(&snapshot);
                    }
                    Some(start) => {
                        debug!(
                            "Synced as {}: starting at {:.3}s (loop {})",
                            snapshot.viewer_id, start.position, start.loop_count
                        );
                        self.player.start_at(start.position, start.loop_count);
                        self.callback.on_synced(&snapshot);
                    }
                    None => warn!("Discarding unusable sync payload"),
                }
            }

            ServerMessage::Heartbeat(heartbeat) => {
                let actual = self.player.playback_position();
                let check = self.estimator.lock().check_heartbeat(&heartbeat, now, actual);
                if let DriftCheck::Resync { .. } = check {
                    let _ = self.outbound.send(ClientMessage::RequestSync);
                }
                self.callback.on_drift_checked(check);
            }

            ServerMessage::Pong {
                client_send_time, ..
            } => {
                if self.estimator.lock().record_pong(client_send_time, now).is_none() {
                    debug!("Ignoring pong for unknown ping {}", client_send_time);
                }
            }

            ServerMessage::Joined {
                new_session,
                session_count,
            } => self.callback.on_session_joined(&new_session, session_count),

            ServerMessage::Left {
                viewer_id,
                session_count,
            } => self.callback.on_session_left(&viewer_id, session_count),

            ServerMessage::PositionUpdated { viewer_id, x, y } => self
                .callback
                .on_position_updated(&viewer_id, PointerPosition::clamped(x, y)),

            ServerMessage::ActivationResult { total_count } => {
                self.callback.on_activation_result(total_count)
            }
        }
    }
}
