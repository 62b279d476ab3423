//! Device and internal event types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event kinds delivered on the bus.
///
/// Device kinds arrive on the wire; internal kinds are synthesized by
/// the clients themselves (connection lifecycle).
pub mod kind {
    /// Periodic device health report (temperature, battery, charger)
    pub const PI_STATUS: &str = "PiStatus";
    /// The active view (mode/stage/target) changed
    pub const VIEW_STATE_CHANGED: &str = "ViewStateChanged";
    /// Live-stacking progress (frame counts, completion state)
    pub const STACKING_STATUS: &str = "StackingStatus";
    /// Focuser motion progress
    pub const FOCUSER_MOVE: &str = "FocuserMove";
    /// Plate-solve annotation finished
    pub const ANNOTATE_RESULT: &str = "AnnotateResult";
    /// Goto slew progress
    pub const AUTO_GOTO: &str = "AutoGoto";
    /// The device asked clients to change capture mode
    pub const CLIENT_MODE_CHANGED: &str = "ClientModeChanged";
    /// Internal: a transport lost its link
    pub const INTERNAL_DISCONNECTED: &str = "InternalDisconnected";
    /// Internal: a transport re-established its link
    pub const INTERNAL_RECONNECTED: &str = "InternalReconnected";
}

/// An asynchronous notification, either read off the wire or synthesized
/// internally. The payload is the full JSON object the device sent, so
/// fields the library does not model are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub timestamp: Option<String>,
    pub payload: Value,
}

impl Event {
    /// Synthesize an internal event (not read off the wire).
    pub fn internal(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            timestamp: None,
            payload,
        }
    }

    /// The `state` field of the payload, used by progress events
    /// (`working`, `complete`, `fail`, `cancel`, `frame_complete`, ...).
    pub fn state(&self) -> Option<&str> {
        self.payload.get("state").and_then(Value::as_str)
    }

    /// Best-effort failure text from a terminal progress event: the
    /// device puts it in `error`, `message` or `reason` depending on the
    /// operation.
    pub fn failure_reason(&self) -> Option<String> {
        for field in ["error", "message", "reason"] {
            if let Some(text) = self.payload.get(field).and_then(Value::as_str) {
                return Some(text.to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_accessor() {
        let event = Event {
            kind: kind::AUTO_GOTO.to_string(),
            timestamp: Some("t".to_string()),
            payload: json!({"Event": "AutoGoto", "state": "complete"}),
        };
        assert_eq!(event.state(), Some("complete"));
    }

    #[test]
    fn test_failure_reason_priority() {
        let event = Event::internal(
            kind::AUTO_GOTO,
            json!({"state": "fail", "error": "below horizon", "reason": "secondary"}),
        );
        assert_eq!(event.failure_reason().as_deref(), Some("below horizon"));

        let cancel = Event::internal(kind::FOCUSER_MOVE, json!({"state": "cancel", "reason": "user"}));
        assert_eq!(cancel.failure_reason().as_deref(), Some("user"));

        let bare = Event::internal(kind::AUTO_GOTO, json!({"state": "fail"}));
        assert!(bare.failure_reason().is_none());
    }

    #[test]
    fn test_internal_event_has_no_wire_timestamp() {
        let event = Event::internal(kind::INTERNAL_DISCONNECTED, json!({}));
        assert!(event.timestamp.is_none());
        assert_eq!(event.kind, "InternalDisconnected");
    }
}
