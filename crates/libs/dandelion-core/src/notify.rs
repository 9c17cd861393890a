//! Notification and push-channel message types.
//!
//! Release events fan out over two disjoint paths: the live push sockets
//! and the cross-replica event bus. Both carry the same JSON
//! `{event, app_id, config?}` body.
//!
//! Push-channel envelopes are `{action, payload}` and are parsed in two
//! passes: the envelope first, then the payload against the schema the
//! action demands.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::instance::InstanceStatus;
use crate::model::release::Release;

/// Release lifecycle events delivered to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyEvent {
    Publish,
    Rollback,
    Check,
}

/// The notification body. `config` is present for publish/rollback only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyMessage {
    pub event: NotifyEvent,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Release>,
}

impl NotifyMessage {
    pub fn check(app_id: impl Into<String>) -> Self {
        Self {
            event: NotifyEvent::Check,
            app_id: app_id.into(),
            config: None,
        }
    }

    pub fn with_release(event: NotifyEvent, release: Release) -> Self {
        Self {
            event,
            app_id: release.app_id.clone(),
            config: Some(release),
        }
    }
}

/// Raw push-channel envelope, first parse pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub action: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Typed inbound push-channel message, second parse pass.
#[derive(Debug, Clone)]
pub enum WsMessage {
    /// Heartbeat carrying the client's last-known statuses. An absent
    /// payload is a bare heartbeat; an empty array refreshes nothing.
    Ping(Option<Vec<InstanceStatus>>),
    /// A single status transition.
    Status(Box<InstanceStatus>),
}

/// Parse one inbound frame. Unknown actions and malformed payloads fail.
pub fn parse_ws_message(raw: &str) -> Result<WsMessage> {
    let envelope: WsEnvelope = serde_json::from_str(raw)?;
    match envelope.action.as_str() {
        "ping" => match envelope.payload {
            None | Some(serde_json::Value::Null) => Ok(WsMessage::Ping(None)),
            Some(value) => Ok(WsMessage::Ping(Some(serde_json::from_value(value)?))),
        },
        "status" => {
            let value = envelope
                .payload
                .ok_or_else(|| Error::InvalidInput("status message without payload".into()))?;
            Ok(WsMessage::Status(Box::new(serde_json::from_value(value)?)))
        }
        other => Err(Error::InvalidInput(format!("unknown action: {other}"))),
    }
}

/// Encode an outbound status report for the push channel.
pub fn status_frame(status: &InstanceStatus) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::json!({
        "action": "status",
        "payload": status,
    }))?)
}

/// Encode an outbound heartbeat carrying last-known statuses.
pub fn ping_frame(statuses: &[InstanceStatus]) -> Result<String> {
    Ok(serde_json::to_string(&serde_json::json!({
        "action": "ping",
        "payload": statuses,
    }))?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_message() {
        let msg = parse_ws_message(
            r#"{"action":"status","payload":{"app_id":"s1","host":"host1","instance_id":"instance1","config_id":1,"status":1}}"#,
        )
        .unwrap();
        match msg {
            WsMessage::Status(s) => {
                assert_eq!(s.app_id, "s1");
                assert_eq!(s.config_id, 1);
                assert_eq!(s.status, 1);
                assert_eq!(s.commit_id, "");
            }
            _ => panic!("expected status"),
        }
    }

    #[test]
    fn test_parse_ping_variants() {
        // absent payload: bare heartbeat
        let msg = parse_ws_message(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(msg, WsMessage::Ping(None)));

        // null payload behaves the same
        let msg = parse_ws_message(r#"{"action":"ping","payload":null}"#).unwrap();
        assert!(matches!(msg, WsMessage::Ping(None)));

        // empty array: heartbeat with zero refreshes
        let msg = parse_ws_message(r#"{"action":"ping","payload":[]}"#).unwrap();
        match msg {
            WsMessage::Ping(Some(statuses)) => assert!(statuses.is_empty()),
            _ => panic!("expected ping with empty list"),
        }

        let msg = parse_ws_message(
            r#"{"action":"ping","payload":[{"app_id":"s1","host":"h","instance_id":"i","status":3}]}"#,
        )
        .unwrap();
        match msg {
            WsMessage::Ping(Some(statuses)) => assert_eq!(statuses.len(), 1),
            _ => panic!("expected ping with one status"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(parse_ws_message("").is_err());
        assert!(parse_ws_message(r#"{"action":"nope"}"#).is_err());
        assert!(parse_ws_message(r#"{"action":"status","payload":""}"#).is_err());
        assert!(parse_ws_message(r#"{"action":"status"}"#).is_err());
    }

    #[test]
    fn test_notify_message_shape() {
        let msg = NotifyMessage::check("app1");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"event":"check","app_id":"app1"}"#);

        let parsed: NotifyMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event, NotifyEvent::Check);
        assert!(parsed.config.is_none());
    }
}
