//! Sync Protocol Messages
//!
//! One variant per message kind on the wire. Frames are JSON objects tagged
//! by a snake_case `type` field with camelCase payload fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{in_unit_range, Session, ViewerId};

/// Errors for payloads that fail to decode or validate
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Everything a viewer needs to (re)align: timeline state plus presence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    /// Time zero of the loop, ms since UNIX epoch
    pub epoch: u64,
    /// Server wall clock when the snapshot was built (latency bootstrap)
    pub server_now: u64,
    /// Nominal loop duration in seconds
    pub loop_duration: f64,
    /// Seconds into the current repetition
    pub position: f64,
    pub loop_count: u64,
    /// The requesting viewer's own identity
    pub viewer_id: ViewerId,
    pub viewer_color: String,
    pub all_sessions: Vec<Session>,
    pub session_count: usize,
}

/// Periodic authoritative time state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatInfo {
    pub server_now: u64,
    pub epoch: u64,
    pub position: f64,
    pub loop_count: u64,
}

/// Messages sent from the server to a viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full state, sent on connect and in answer to `RequestSync`
    Sync(PresenceSnapshot),

    /// Someone else connected
    Joined {
        new_session: Session,
        session_count: usize,
    },

    /// Someone disconnected
    Left {
        viewer_id: ViewerId,
        session_count: usize,
    },

    /// Another viewer moved its pointer
    PositionUpdated { viewer_id: ViewerId, x: f64, y: f64 },

    /// Answer to a latency ping
    Pong {
        /// Echo of the ping's timestamp, in the viewer's own clock
        client_send_time: f64,
        server_now: u64,
        position: f64,
        loop_count: u64,
    },

    Heartbeat(HeartbeatInfo),

    /// An activation from this viewer was counted
    ActivationResult { total_count: u64 },
}

impl ServerMessage {
    /// Decode a frame received from the server
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Sync(_) => "sync",
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::Left { .. } => "left",
            ServerMessage::PositionUpdated { .. } => "position_updated",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Heartbeat(_) => "heartbeat",
            ServerMessage::ActivationResult { .. } => "activation_result",
        }
    }
}

/// Messages sent from a viewer to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Pointer moved, both axes in `[0, 1]`
    UpdatePosition { x: f64, y: f64 },

    /// Ask for a fresh `Sync`
    RequestSync,

    /// Latency ping carrying the viewer's local send time (ms)
    Ping { client_send_time: f64 },

    /// The special activation event
    Activate,
}

impl ClientMessage {
    /// Decode and validate a frame received from a viewer
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let message: ClientMessage = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    /// Check field ranges that the type system does not capture
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match *self {
            ClientMessage::UpdatePosition { x, y } => {
                if !in_unit_range(x) {
                    return Err(ProtocolError::OutOfRange { field: "x", value: x });
                }
                if !in_unit_range(y) {
                    return Err(ProtocolError::OutOfRange { field: "y", value: y });
                }
                Ok(())
            }
            ClientMessage::Ping { client_send_time } => {
                if client_send_time.is_finite() && client_send_time >= 0.0 {
                    Ok(())
                } else {
                    Err(ProtocolError::OutOfRange {
                        field: "clientSendTime",
                        value: client_send_time,
                    })
                }
            }
            ClientMessage::RequestSync | ClientMessage::Activate => Ok(()),
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::UpdatePosition { .. } => "update_position",
            ClientMessage::RequestSync => "request_sync",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Activate => "activate",
        }
    }
}
