//! Wire format for the LF-delimited JSON control channel
//!
//! Outgoing envelopes always carry `id`, `method` and `params`. Incoming
//! lines are arbitrary JSON objects classified into responses (carry an
//! `id` plus `result` or `error`), events (carry an `Event` name, or a
//! `method` without an `id`) and notifications (everything else, logged
//! and dropped). Fields this module does not know about ride along
//! untouched inside the opaque payload.

use std::time::SystemTime;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::event::Event;

/// Error object inside a device response.
///
/// Most firmware versions answer with `{"code": N, "message": "..."}`;
/// older ones answer with a bare string, which maps to code 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

impl<'de> Deserialize<'de> for DeviceError {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Object { code: Option<i64>, message: Option<String> },
            Text(String),
        }
        Ok(match Wire::deserialize(deserializer)? {
            Wire::Object { code, message } => DeviceError {
                code: code.unwrap_or(0),
                message: message.unwrap_or_default(),
            },
            Wire::Text(message) => DeviceError { code: 0, message },
        })
    }
}

/// A correlated reply from the device.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<DeviceError>,
    /// Device-side timestamp string, when present
    pub timestamp: Option<String>,
    /// Local wall-clock time at which the line was decoded
    pub received_at: SystemTime,
}

impl CommandResponse {
    /// Unwrap `result`, mapping a device `error` to `CommandRejected`.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(Error::CommandRejected {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// One classified line off the control channel.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(CommandResponse),
    Event(Event),
    /// Valid JSON the classifier has no rule for; logged and dropped
    Notification(Value),
}

/// Encode an outgoing envelope as an LF-terminated JSON line.
pub fn encode_envelope(id: u64, method: &str, params: &Value) -> Bytes {
    let envelope = json!({ "id": id, "method": method, "params": params });
    let mut line = envelope.to_string().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

/// Parse and classify one line. JSON parse failures surface as
/// `Protocol` errors; the caller counts them and keeps reading.
pub fn classify_line(line: &str) -> Result<IncomingMessage> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("bad json line: {e}")))?;

    let Some(obj) = value.as_object() else {
        return Ok(IncomingMessage::Notification(value));
    };

    let id = obj.get("id").and_then(Value::as_u64);
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if let (Some(id), true) = (id, has_result || has_error) {
        let error = match obj.get("error") {
            Some(v) if !v.is_null() => Some(
                serde_json::from_value(v.clone())
                    .map_err(|e| Error::Protocol(format!("bad error object: {e}")))?,
            ),
            _ => None,
        };
        return Ok(IncomingMessage::Response(CommandResponse {
            id,
            result: obj.get("result").cloned(),
            error,
            timestamp: obj
                .get("Timestamp")
                .and_then(Value::as_str)
                .map(str::to_string),
            received_at: SystemTime::now(),
        }));
    }

    let event_kind = obj
        .get("Event")
        .and_then(Value::as_str)
        .or_else(|| {
            if id.is_none() {
                obj.get("method").and_then(Value::as_str)
            } else {
                None
            }
        })
        .map(str::to_string);

    if let Some(kind) = event_kind {
        let timestamp = obj
            .get("Timestamp")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(IncomingMessage::Event(Event {
            kind,
            timestamp,
            payload: value,
        }));
    }

    Ok(IncomingMessage::Notification(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Envelope encoding ==========

    #[test]
    fn test_envelope_roundtrip() {
        let params = json!({"ra": 10.5, "dec": 45.0});
        let line = encode_envelope(7, "iscope_start_view", &params);
        assert_eq!(line.last(), Some(&b'\n'));

        let decoded: Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded["id"], 7);
        assert_eq!(decoded["method"], "iscope_start_view");
        assert_eq!(decoded["params"], params);
    }

    #[test]
    fn test_envelope_empty_params() {
        let line = encode_envelope(1, "get_time", &json!({}));
        let decoded: Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded["params"], json!({}));
    }

    #[test]
    fn test_envelope_is_single_line() {
        let params = json!({"target_name": "M31", "lp_filter": false});
        let line = encode_envelope(2, "iscope_start_view", &params);
        let body = &line[..line.len() - 1];
        assert!(!body.contains(&b'\n'));
    }

    // ========== Classification ==========

    #[test]
    fn test_classify_response_with_result() {
        let msg = classify_line(r#"{"id": 3, "result": {"time": "2024-01-02T03:04:05Z"}}"#).unwrap();
        match msg {
            IncomingMessage::Response(resp) => {
                assert_eq!(resp.id, 3);
                assert_eq!(resp.result.unwrap()["time"], "2024-01-02T03:04:05Z");
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_response_with_error_object() {
        let msg = classify_line(r#"{"id": 4, "error": {"code": 215, "message": "below horizon"}}"#)
            .unwrap();
        match msg {
            IncomingMessage::Response(resp) => {
                let err = resp.error.unwrap();
                assert_eq!(err.code, 215);
                assert_eq!(err.message, "below horizon");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_response_with_string_error() {
        let msg = classify_line(r#"{"id": 5, "error": "Unknown method: bogus"}"#).unwrap();
        match msg {
            IncomingMessage::Response(resp) => {
                let err = resp.error.unwrap();
                assert_eq!(err.code, 0);
                assert_eq!(err.message, "Unknown method: bogus");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_event_by_event_field() {
        let msg =
            classify_line(r#"{"Event": "PiStatus", "Timestamp": "t1", "temp": 25.5}"#).unwrap();
        match msg {
            IncomingMessage::Event(event) => {
                assert_eq!(event.kind, "PiStatus");
                assert_eq!(event.timestamp.as_deref(), Some("t1"));
                // unknown fields survive inside the opaque payload
                assert_eq!(event.payload["temp"], 25.5);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_event_by_method_without_id() {
        let msg = classify_line(r#"{"method": "FocuserMove", "position": 5000}"#).unwrap();
        match msg {
            IncomingMessage::Event(event) => assert_eq!(event.kind, "FocuserMove"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_method_with_id_is_not_event() {
        // An id plus method but no result/error: not a response, not an
        // event. Falls through to notification.
        let msg = classify_line(r#"{"id": 9, "method": "get_time"}"#).unwrap();
        assert!(matches!(msg, IncomingMessage::Notification(_)));
    }

    #[test]
    fn test_classify_notification() {
        let msg = classify_line(r#"{"hello": "world"}"#).unwrap();
        assert!(matches!(msg, IncomingMessage::Notification(_)));
    }

    #[test]
    fn test_classify_parse_failure() {
        match classify_line("{not json") {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_response_into_result_maps_rejection() {
        let resp = CommandResponse {
            id: 1,
            result: None,
            error: Some(DeviceError {
                code: 102,
                message: "busy".to_string(),
            }),
            timestamp: None,
            received_at: SystemTime::now(),
        };
        match resp.into_result() {
            Err(Error::CommandRejected { code, message }) => {
                assert_eq!(code, 102);
                assert_eq!(message, "busy");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
