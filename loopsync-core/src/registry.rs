//! Session Registry
//!
//! Tracks every connected viewer and its last-known pointer position. The
//! registry itself is a plain map; callers serialize access to it (the
//! engine keeps it behind a single lock together with the rest of the
//! presence state).

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier assigned to a viewer by the transport at connect time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(String);

impl ViewerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ViewerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Normalized pointer position, each axis in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerPosition {
    pub x: f64,
    pub y: f64,
}

impl PointerPosition {
    /// Neutral position given to new sessions
    pub const CENTER: Self = Self { x: 0.5, y: 0.5 };

    /// Build a position, rejecting values outside `[0, 1]`
    pub fn new(x: f64, y: f64) -> Option<Self> {
        if in_unit_range(x) && in_unit_range(y) {
            Some(Self { x, y })
        } else {
            None
        }
    }

    /// Build a position, clamping each axis into `[0, 1]` (non-finite becomes center)
    pub fn clamped(x: f64, y: f64) -> Self {
        let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.5 };
        Self { x: clamp(x), y: clamp(y) }
    }
}

impl Default for PointerPosition {
    fn default() -> Self {
        Self::CENTER
    }
}

pub(crate) fn in_unit_range(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// One connected viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: ViewerId,
    /// Display color, `#rrggbb`
    pub color: String,
    #[serde(flatten)]
    pub pointer: PointerPosition,
}

/// Registry errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Session {0} is already registered")]
    DuplicateSession(ViewerId),
}

/// All currently connected sessions, keyed by viewer id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ViewerId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session at the center position.
    ///
    /// The transport guarantees unique ids, so a duplicate is an invariant
    /// violation and the existing session is left untouched.
    pub fn join(&mut self, id: ViewerId, color: String) -> Result<Session, RegistryError> {
        if self.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }

        let session = Session {
            id: id.clone(),
            color,
            pointer: PointerPosition::CENTER,
        };
        self.sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn leave(&mut self, id: &ViewerId) -> Option<Session> {
        let removed = self.sessions.remove(id);
        if removed.is_none() {
            warn!("Leave for unknown session {}", id);
        }
        removed
    }

    /// Move a session's pointer. Returns false if the session is gone
    /// (an update racing a disconnect).
    pub fn update_position(&mut self, id: &ViewerId, pointer: PointerPosition) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.pointer = pointer;
                true
            }
            None => {
                debug!("Ignoring position update for unknown session {}", id);
                false
            }
        }
    }

    /// Copy of all sessions (ordered by id) and their count
    pub fn snapshot(&self) -> (Vec<Session>, usize) {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        let count = sessions.len();
        (sessions, count)
    }

    pub fn get(&self, id: &ViewerId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &ViewerId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Colors currently held by connected sessions
    pub fn colors_in_use(&self) -> HashSet<&str> {
        self.sessions.values().map(|s| s.color.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> ViewerId {
        ViewerId::new(format!("v{}", n))
    }

    #[test]
    fn test_join_starts_at_center() {
        let mut registry = SessionRegistry::new();
        let session = registry.join(id(1), "#ff0000".to_string()).unwrap();
        assert_eq!(session.pointer, PointerPosition::CENTER);
        assert_eq!(session.color, "#ff0000");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_join_is_rejected() {
        let mut registry = SessionRegistry::new();
        registry.join(id(1), "#ff0000".to_string()).unwrap();
        let err = registry.join(id(1), "#00ff00".to_string()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSession(id(1)));
        // First session untouched
        assert_eq!(registry.get(&id(1)).unwrap().color, "#ff0000");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cardinality_after_joins_and_leaves() {
        for (joins, leaves) in [(0, 0), (1, 1), (5, 2), (20, 20), (13, 0)] {
            let mut registry = SessionRegistry::new();
            for n in 0..joins {
                registry.join(id(n), format!("#{:06x}", n)).unwrap();
            }
            for n in 0..leaves {
                assert!(registry.leave(&id(n)).is_some());
            }
            assert_eq!(registry.len(), joins - leaves);
            assert_eq!(registry.snapshot().1, joins - leaves);
        }
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut registry = SessionRegistry::new();
        registry.join(id(1), "#ff0000".to_string()).unwrap();
        assert!(registry.leave(&id(1)).is_some());
        assert!(registry.leave(&id(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_after_leave_is_ignored() {
        let mut registry = SessionRegistry::new();
        registry.join(id(1), "#ff0000".to_string()).unwrap();
        registry.join(id(2), "#00ff00".to_string()).unwrap();
        registry.leave(&id(1));

        let moved = PointerPosition::new(0.1, 0.9).unwrap();
        assert!(!registry.update_position(&id(1), moved));
        assert!(registry.update_position(&id(2), moved));

        let (sessions, count) = registry.snapshot();
        assert_eq!(count, 1);
        assert_eq!(sessions[0].pointer, moved);
    }

    #[test]
    fn test_pointer_validation() {
        assert!(PointerPosition::new(0.0, 1.0).is_some());
        assert!(PointerPosition::new(-0.01, 0.5).is_none());
        assert!(PointerPosition::new(0.5, 1.5).is_none());
        assert!(PointerPosition::new(f64::NAN, 0.5).is_none());

        let clamped = PointerPosition::clamped(-2.0, 7.0);
        assert_eq!(clamped, PointerPosition { x: 0.0, y: 1.0 });
        assert_eq!(PointerPosition::clamped(f64::NAN, 0.2).x, 0.5);
    }

    #[test]
    fn test_session_wire_shape() {
        let session = Session {
            id: id(7),
            color: "#123456".to_string(),
            pointer: PointerPosition { x: 0.25, y: 0.75 },
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "id": "v7", "color": "#123456", "x": 0.25, "y": 0.75 })
        );
    }
}
