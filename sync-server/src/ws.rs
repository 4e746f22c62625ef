//! WebSocket transport: one task pair per viewer connection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use loopsync_core::engine::Outcome;
use loopsync_core::sync::outbound_channel;
use loopsync_core::{ClientMessage, SessionPhase, SyncEngine, ViewerId};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::AllowedOrigins;
use crate::metrics::{LogLevel, Metrics};

/// Shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub metrics: Arc<RwLock<Metrics>>,
    pub origins: Arc<AllowedOrigins>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, metrics: Arc<RwLock<Metrics>>, origins: AllowedOrigins) -> Self {
        Self {
            engine,
            metrics,
            origins: Arc::new(origins),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ids are never reused within a process
    pub fn next_viewer_id(&self) -> ViewerId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        ViewerId::new(format!("v{}", n))
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = match headers.get(header::ORIGIN).map(|v| v.to_str()) {
        None => None,
        Some(Ok(origin)) => Some(origin),
        Some(Err(_)) => return StatusCode::FORBIDDEN.into_response(),
    };

    if !state.origins.allows(origin) {
        let origin = origin.unwrap_or_default();
        warn!("Rejected websocket from origin {}", origin);
        state
            .metrics
            .write()
            .log(LogLevel::Warning, format!("Rejected origin: {}", origin));
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let viewer = state.next_viewer_id();
    let mut phase = SessionPhase::Connecting;
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = outbound_channel();

    let session = match state.engine.connect(viewer.clone(), outbound_tx) {
        Ok(session) => session,
        Err(err) => {
            error!("Could not register {}: {}", viewer, err);
            state.metrics.write().log(LogLevel::Error, err.to_string());
            return;
        }
    };
    phase.activate();
    state.metrics.write().viewer_connected(viewer.as_str(), &session.color);

    // Writer: drains the queue the engine fills
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("Failed to encode {}: {}", message.kind(), err);
                    continue;
                }
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: frames are handled in arrival order until the phase closes
    while phase.accepts_messages() {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => handle_frame(&state, &viewer, &text),
            Some(Ok(Message::Binary(_))) => debug!("Ignoring binary frame from {}", viewer),
            Some(Ok(Message::Close(_))) | None => phase.close(),
            // Ping/pong are answered by the websocket layer
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!("Websocket error for {}: {}", viewer, err);
                phase.close();
            }
        }
    }

    let remaining = state.engine.disconnect(&viewer);
    state.metrics.write().viewer_disconnected(viewer.as_str());
    writer.abort();
    info!("{} closed, {} remaining", viewer, remaining);
}

/// Decode one text frame and hand it to the engine
pub fn handle_frame(state: &AppState, viewer: &ViewerId, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(err) => {
            debug!("Dropping frame from {}: {}", viewer, err);
            return;
        }
    };

    match state.engine.handle_message(viewer, message) {
        Outcome::ActivationAccepted { total } => {
            state.metrics.write().activation_accepted(viewer.as_str(), total)
        }
        Outcome::ActivationDebounced => state.metrics.write().activation_debounced(),
        Outcome::UnknownSession => {
            state
                .metrics
                .write()
                .log(LogLevel::Warning, format!("Message from unknown session {}", viewer));
        }
        Outcome::Replied | Outcome::Broadcast { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopsync_core::{EngineConfig, LoopClock, LoopDuration, ServerMessage};

    fn state() -> AppState {
        let clock = LoopClock::starting_now(LoopDuration::from_secs(21.0).unwrap());
        let engine = Arc::new(SyncEngine::new(clock, EngineConfig::default()));
        AppState::new(engine, Arc::new(RwLock::new(Metrics::new())), AllowedOrigins::Any)
    }

    #[test]
    fn test_viewer_ids_are_unique() {
        let state = state();
        let other = state.clone();
        assert_eq!(state.next_viewer_id().as_str(), "v1");
        assert_eq!(other.next_viewer_id().as_str(), "v2");
        assert_eq!(state.next_viewer_id().as_str(), "v3");
    }

    #[tokio::test]
    async fn test_frames_reach_engine() {
        let state = state();
        let viewer = ViewerId::from("v1");
        let (tx, mut rx) = outbound_channel();
        state.engine.connect(viewer.clone(), tx).unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::Sync(_))));

        handle_frame(&state, &viewer, r#"{"type":"activate"}"#);
        handle_frame(&state, &viewer, r#"{"type":"activate"}"#);
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::ActivationResult { total_count: 1 })
        );

        let m = state.metrics.read();
        assert_eq!(m.activations_accepted, 1);
        assert_eq!(m.activations_debounced, 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let state = state();
        let viewer = ViewerId::from("v1");
        let (tx, mut rx) = outbound_channel();
        state.engine.connect(viewer.clone(), tx).unwrap();
        let _ = rx.recv().await;

        handle_frame(&state, &viewer, "not json");
        handle_frame(&state, &viewer, r#"{"type":"update_position","x":3.0,"y":0.5}"#);
        handle_frame(&state, &viewer, r#"{"type":"teleport"}"#);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.engine.session_count(), 1);
    }
}
