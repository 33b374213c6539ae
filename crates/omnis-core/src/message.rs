//! The message envelope exchanged between the UI and engine processes.
//!
//! Every message on the wire is one [`Envelope`] in one of three kinds:
//!
//! ```json
//! // Request
//! {"version":"1.0","type":"request","id":"uuid","timestamp":1700000000,
//!  "payload":{"command":"PING","args":{"echo":"hello"}}}
//! // Response
//! {"version":"1.0","type":"response","id":"uuid","timestamp":1700000001,
//!  "payload":{"status":"success","command":"PING","result":{"pong":true}}}
//! // Event
//! {"version":"1.0","type":"event","id":"uuid","timestamp":1700000002,
//!  "payload":{"event":"JOB_PROGRESS","data":{"percent":40}}}
//! ```
//!
//! Envelopes are immutable once constructed; each hop builds a fresh one.
//! A response echoes the `id` of the request it answers; events carry their
//! own id purely for logging.

use crate::command::{Command, ErrorCode, EventKind};
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: &str = "1.0";

/// All versions the receiver accepts. Anything else is rejected before any
/// further processing.
pub const SUPPORTED_VERSIONS: &[&str] = &[PROTOCOL_VERSION];

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

/// Error details embedded in an error response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable code from the fixed taxonomy.
    pub code: ErrorCode,
    /// Human-readable message the UI is expected to render.
    pub message: String,
    /// Diagnostic context; never parsed by the UI.
    #[serde(default)]
    pub details: Value,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// The versioned wrapper for every message crossing the trust boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version; must be a member of [`SUPPORTED_VERSIONS`].
    pub version: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Correlation identifier. Unique per request, echoed by its response.
    pub id: String,
    /// Unix seconds at construction. Informational only.
    pub timestamp: i64,
    /// Kind-dependent payload map.
    pub payload: Value,
}

impl Envelope {
    fn new(kind: MessageType, id: String, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            kind,
            id,
            timestamp: chrono::Utc::now().timestamp(),
            payload,
        }
    }

    /// Build a request with a fresh unique id.
    pub fn request(command: Command, args: Value) -> Self {
        Self::new(
            MessageType::Request,
            uuid::Uuid::new_v4().to_string(),
            json!({ "command": command.as_str(), "args": args }),
        )
    }

    /// Build a success response answering `request_id`.
    pub fn response(request_id: &str, command: &str, result: Value) -> Self {
        Self::new(
            MessageType::Response,
            request_id.to_string(),
            json!({ "status": "success", "command": command, "result": result }),
        )
    }

    /// Build an error response answering `request_id`.
    pub fn error_response(request_id: &str, command: &str, error: ErrorInfo) -> Self {
        Self::new(
            MessageType::Response,
            request_id.to_string(),
            json!({
                "status": "error",
                "command": command,
                "error": {
                    "code": error.code.as_str(),
                    "message": error.message,
                    "details": error.details,
                },
            }),
        )
    }

    /// Build a broadcast event.
    pub fn event(kind: EventKind, data: Value) -> Self {
        Self::new(
            MessageType::Event,
            uuid::Uuid::new_v4().to_string(),
            json!({ "event": kind.as_str(), "data": data }),
        )
    }

    /// Serialize to the compact JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Parse an envelope from wire bytes.
    ///
    /// Fails distinctly for invalid JSON, a missing or mistyped required
    /// field, and an unsupported version. The version gate runs before the
    /// payload is examined.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: Value = serde_json::from_slice(bytes).map_err(ProtocolError::MalformedJson)?;
        let obj = raw
            .as_object()
            .ok_or(ProtocolError::MissingField("version"))?;

        let version = obj
            .get("version")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("version"))?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()));
        }

        let kind = obj
            .get("type")
            .cloned()
            .and_then(|v| serde_json::from_value::<MessageType>(v).ok())
            .ok_or(ProtocolError::MissingField("type"))?;
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("id"))?;
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingField("timestamp"))?;
        let payload = obj
            .get("payload")
            .cloned()
            .ok_or(ProtocolError::MissingField("payload"))?;

        Ok(Self {
            version: version.to_string(),
            kind,
            id: id.to_string(),
            timestamp,
            payload,
        })
    }

    /// Kind-specific structural check: a request carries a non-empty
    /// `command`, a response a `status`, an event an `event` name.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.kind {
            MessageType::Request => match self.payload.get("command").and_then(Value::as_str) {
                Some(c) if !c.is_empty() => Ok(()),
                _ => Err(ProtocolError::MissingField("command")),
            },
            MessageType::Response => match self.payload.get("status").and_then(Value::as_str) {
                Some(_) => Ok(()),
                None => Err(ProtocolError::MissingField("status")),
            },
            MessageType::Event => match self.payload.get("event").and_then(Value::as_str) {
                Some(e) if !e.is_empty() => Ok(()),
                _ => Err(ProtocolError::MissingField("event")),
            },
        }
    }

    // ── Payload accessors ────────────────────────────────────────────────

    /// Command name of a request, if present.
    pub fn command(&self) -> Option<&str> {
        self.payload.get("command").and_then(Value::as_str)
    }

    /// Request arguments; `Null` when absent.
    pub fn args(&self) -> Value {
        self.payload.get("args").cloned().unwrap_or(Value::Null)
    }

    /// True for a response whose status is `"success"`.
    pub fn is_success(&self) -> bool {
        self.kind == MessageType::Response
            && self.payload.get("status").and_then(Value::as_str) == Some("success")
    }

    /// Result map of a success response; `Null` when absent.
    pub fn result(&self) -> Value {
        self.payload.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Error details of an error response, if present and well-formed.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        let err = self.payload.get("error")?;
        serde_json::from_value(err.clone()).ok()
    }

    /// Event name of an event message, if present.
    pub fn event_name(&self) -> Option<&str> {
        self.payload.get("event").and_then(Value::as_str)
    }

    /// Event data; `Null` when absent.
    pub fn event_data(&self) -> Value {
        self.payload.get("data").cloned().unwrap_or(Value::Null)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let env = Envelope::request(Command::Ping, json!({ "echo": "hello" }));
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.command(), Some("PING"));
        assert_eq!(back.args()["echo"], "hello");
    }

    #[test]
    fn test_response_roundtrip() {
        let env = Envelope::response("req-1", "PING", json!({ "pong": true }));
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back, env);
        assert!(back.is_success());
        assert_eq!(back.id, "req-1");
        assert_eq!(back.result()["pong"], true);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let env = Envelope::error_response(
            "req-2",
            "START_INSTALLATION",
            ErrorInfo::new(ErrorCode::InvalidTarget, "target outside allowed roots")
                .with_details(json!({ "path": "/etc" })),
        );
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back, env);
        assert!(!back.is_success());
        let info = back.error_info().unwrap();
        assert_eq!(info.code, ErrorCode::InvalidTarget);
        assert_eq!(info.details["path"], "/etc");
    }

    #[test]
    fn test_event_roundtrip() {
        let env = Envelope::event(EventKind::JobProgress, json!({ "percent": 40 }));
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.event_name(), Some("JOB_PROGRESS"));
        assert_eq!(back.event_data()["percent"], 40);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Envelope::request(Command::Ping, Value::Null);
        let b = Envelope::request(Command::Ping, Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let err = Envelope::decode(b"not json{{").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedJson(_)));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let err = Envelope::decode(br#"{"version":"1.0","type":"request"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("id")));
    }

    #[test]
    fn test_decode_rejects_unsupported_version() {
        // Otherwise fully valid structure; the version gate must win.
        let bytes = br#"{"version":"2.0","type":"request","id":"x","timestamp":0,
                         "payload":{"command":"PING","args":{}}}"#;
        let err = Envelope::decode(bytes).unwrap_err();
        match err {
            ProtocolError::UnsupportedVersion(v) => assert_eq!(v, "2.0"),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
        assert_eq!(err_code(bytes), ErrorCode::UnsupportedVersion);
    }

    fn err_code(bytes: &[u8]) -> ErrorCode {
        Envelope::decode(bytes).unwrap_err().error_code()
    }

    #[test]
    fn test_validate_request_needs_command() {
        let mut env = Envelope::request(Command::Ping, Value::Null);
        env.validate().unwrap();
        env.payload = json!({ "args": {} });
        assert!(env.validate().is_err());
        env.payload = json!({ "command": "", "args": {} });
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_validate_event_needs_name() {
        let mut env = Envelope::event(EventKind::EngineReady, Value::Null);
        env.validate().unwrap();
        env.payload = json!({ "data": {} });
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_validate_response_needs_status() {
        let mut env = Envelope::response("r", "PING", Value::Null);
        env.validate().unwrap();
        env.payload = json!({ "command": "PING" });
        assert!(env.validate().is_err());
    }
}
