use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pv_events::EventType;

use crate::method::RequestMethod;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client request frame.
///
/// The method stays a raw string at the wire layer so that an unknown
/// method is reported as `Unknown request method: <m>` against the
/// real request id rather than as a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Request id, unique within a connection; echoed on the response.
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Duplicate requests with the same key return the cached
    /// successful response for up to the idempotency TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Server response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ResponseMessage {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for an unparseable inbound frame: the request id is
    /// unknown, so the response carries the literal `"unknown"`.
    pub fn invalid_format(detail: impl std::fmt::Display) -> Self {
        Self::err("unknown", format!("Invalid message format: {detail}"))
    }

    pub fn unknown_method(id: impl Into<String>, method: &str) -> Self {
        Self::err(id, format!("Unknown request method: {method}"))
    }

    pub fn internal_error(id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::err(id, format!("Internal error: {detail}"))
    }
}

/// Server-initiated event frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: EventType,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    pub fn new(event: EventType, payload: Value, seq: Option<u64>) -> Self {
        Self {
            event,
            payload,
            seq,
            timestamp: Utc::now(),
        }
    }
}

/// Any inbound/outbound frame, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "req")]
    Request(RequestMessage),
    #[serde(rename = "res")]
    Response(ResponseMessage),
    #[serde(rename = "event")]
    Event(EventMessage),
}

impl WireMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl RequestMessage {
    /// Resolve the method against the fixed table.
    pub fn parsed_method(&self) -> Option<RequestMethod> {
        RequestMethod::parse(&self.method)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    #[default]
    Client,
    Node,
    Admin,
}

/// Identity a client binds during the `connect` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub role: DeviceRole,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_parses() {
        let raw = r#"{"type":"req","id":"r1","method":"health","params":{},"idempotency_key":"k1"}"#;
        let msg = WireMessage::parse(raw).unwrap();
        match msg {
            WireMessage::Request(req) => {
                assert_eq!(req.id, "r1");
                assert_eq!(req.parsed_method(), Some(RequestMethod::Health));
                assert_eq!(req.idempotency_key.as_deref(), Some("k1"));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn unknown_method_parses_but_does_not_resolve() {
        let raw = r#"{"type":"req","id":"r1","method":"nope","params":{}}"#;
        let msg = WireMessage::parse(raw).unwrap();
        match msg {
            WireMessage::Request(req) => {
                assert_eq!(req.method, "nope");
                assert_eq!(req.parsed_method(), None);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_frame_serializes_discriminant() {
        let res = ResponseMessage::ok("r1", serde_json::json!({"status": "connected"}));
        let json = serde_json::to_value(WireMessage::Response(res)).unwrap();
        assert_eq!(json["type"], "res");
        assert_eq!(json["ok"], true);
        assert_eq!(json["payload"]["status"], "connected");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn invalid_format_response_uses_unknown_id() {
        let res = ResponseMessage::invalid_format("expected value at line 1");
        assert_eq!(res.id, "unknown");
        assert!(!res.ok);
        assert!(res.error.unwrap().starts_with("Invalid message format:"));
    }

    #[test]
    fn event_frame_carries_seq() {
        let event = EventMessage::new(
            pv_events::EventType::Heartbeat,
            serde_json::json!({}),
            Some(7),
        );
        let json = serde_json::to_value(WireMessage::Event(event)).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "heartbeat");
        assert_eq!(json["seq"], 7);
    }

    #[test]
    fn device_identity_defaults() {
        let identity: DeviceIdentity =
            serde_json::from_str(r#"{"device_id":"d1"}"#).unwrap();
        assert_eq!(identity.role, DeviceRole::Client);
        assert!(identity.capabilities.is_empty());
    }
}
