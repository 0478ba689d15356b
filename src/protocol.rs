//! Wire shapes for the stream protocol and observed workspace events.
//!
//! Client requests are JSON objects discriminated by `type` and carry a
//! `requestId` next to the command fields. The server answers each request with
//! a `stream.response` frame and pushes `stream.event` frames for every
//! subscription the connection holds.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    error::StreamError,
    types::{Cursor, SessionExit, StreamScope, SubscriptionId},
    workspace::WorkspaceMutation,
};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamCommand {
    #[serde(rename = "stream.subscribe", rename_all = "camelCase")]
    Subscribe {
        tenant_id: String,
        user_id: String,
        workspace_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_cursor: Option<Cursor>,
    },
    #[serde(rename = "stream.unsubscribe", rename_all = "camelCase")]
    Unsubscribe { subscription_id: String },
    #[serde(rename = "workspace.snapshot", rename_all = "camelCase")]
    Snapshot {
        tenant_id: String,
        user_id: String,
        workspace_id: String,
    },
    #[serde(rename = "workspace.mutate")]
    Mutate { mutations: Vec<WorkspaceMutation> },
}

impl StreamCommand {
    pub fn subscribe(scope: &StreamScope, after_cursor: Option<Cursor>) -> Self {
        Self::Subscribe {
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            workspace_id: scope.workspace_id.clone(),
            conversation_id: scope.conversation_id.clone(),
            after_cursor,
        }
    }

    pub fn snapshot(scope: &StreamScope) -> Self {
        Self::Snapshot {
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            workspace_id: scope.workspace_id.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "stream.subscribe",
            Self::Unsubscribe { .. } => "stream.unsubscribe",
            Self::Snapshot { .. } => "workspace.snapshot",
            Self::Mutate { .. } => "workspace.mutate",
        }
    }
}

/// Serialize `command` as a request frame with `requestId` set.
pub fn encode_request(request_id: &str, command: &StreamCommand) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(command)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("requestId".into(), Value::String(request_id.to_string()));
    }
    Ok(value)
}

/// Split an incoming request frame into its `requestId` and command.
pub fn decode_request(frame: &Value) -> (Option<String>, Result<StreamCommand, serde_json::Error>) {
    let request_id = frame
        .get("requestId")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    (request_id, StreamCommand::deserialize(frame))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
}

impl From<&StreamError> for ProtocolError {
    fn from(error: &StreamError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// One event delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDelivery {
    pub subscription_id: SubscriptionId,
    pub cursor: Cursor,
    pub event: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "stream.response", rename_all = "camelCase")]
    Response {
        #[serde(default)]
        request_id: Option<String>,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ProtocolError>,
    },
    #[serde(rename = "stream.event")]
    Event(StreamDelivery),
}

impl ServerFrame {
    pub fn ok(request_id: Option<String>, result: Value) -> Self {
        Self::Response {
            request_id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(request_id: Option<String>, error: ProtocolError) -> Self {
        Self::Response {
            request_id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub subscription_id: SubscriptionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// Validate a subscribe response. The subscription id must be a non-empty
/// string; a missing or non-numeric cursor is tolerated.
pub fn parse_subscribe_response(response: &Value) -> Result<SubscribeAck, StreamError> {
    let subscription_id = response
        .get("subscriptionId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(StreamError::MalformedSubscriptionId)?;
    Ok(SubscribeAck {
        subscription_id: subscription_id.to_string(),
        cursor: response.get("cursor").and_then(Value::as_u64),
    })
}

/// Domain events on the observed-event stream. Payload records stay as raw JSON
/// so a bad record is rejected when it is projected, not when the frame is
/// read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ObservedEvent {
    RepositoryUpserted {
        #[serde(default)]
        repository: Value,
    },
    RepositoryUpdated {
        #[serde(default)]
        repository: Value,
    },
    #[serde(rename_all = "camelCase")]
    RepositoryArchived { repository_id: String, ts: String },
    TaskCreated {
        #[serde(default)]
        task: Value,
    },
    TaskUpdated {
        #[serde(default)]
        task: Value,
    },
    #[serde(rename_all = "camelCase")]
    TaskDeleted { task_id: String },
    TaskReordered {
        #[serde(default)]
        tasks: Vec<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl ObservedEvent {
    /// Parse a wire event. Malformed known kinds come back as `None`; unknown
    /// kinds as [`ObservedEvent::Unknown`].
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn session_output_event(session_id: &str, chunk: &[u8]) -> Value {
    json!({
        "type": "session-output",
        "sessionId": session_id,
        "chunk": base64::engine::general_purpose::STANDARD.encode(chunk),
    })
}

pub fn session_exit_event(session_id: &str, exit: &SessionExit) -> Value {
    json!({
        "type": "session-exit",
        "sessionId": session_id,
        "code": exit.code,
        "signal": exit.signal,
    })
}

pub fn session_started_event(session_id: &str, command: &str, pid: Option<u32>) -> Value {
    let mut event = Map::new();
    event.insert("type".into(), json!("session-started"));
    event.insert("sessionId".into(), json!(session_id));
    event.insert("command".into(), json!(command));
    if let Some(pid) = pid {
        event.insert("pid".into(), json!(pid));
    }
    Value::Object(event)
}

/// Decode the base64 `chunk` of a `session-output` event.
pub fn decode_session_chunk(event: &Value) -> Option<Vec<u8>> {
    if event.get("type").and_then(Value::as_str) != Some("session-output") {
        return None;
    }
    let chunk = event.get("chunk").and_then(Value::as_str)?;
    base64::engine::general_purpose::STANDARD.decode(chunk).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamScope;

    #[test]
    fn subscribe_command_uses_camel_case_and_omits_absent_fields() {
        let scope = StreamScope::workspace("t1", "u1", "w1");
        let frame = encode_request("r-1", &StreamCommand::subscribe(&scope, None)).unwrap();
        assert_eq!(
            frame,
            json!({
                "type": "stream.subscribe",
                "tenantId": "t1",
                "userId": "u1",
                "workspaceId": "w1",
                "requestId": "r-1",
            })
        );

        let scoped = scope.with_conversation("c1");
        let frame = encode_request("r-2", &StreamCommand::subscribe(&scoped, Some(7))).unwrap();
        assert_eq!(frame["conversationId"], "c1");
        assert_eq!(frame["afterCursor"], 7);
    }

    #[test]
    fn decode_request_keeps_request_id_even_when_command_is_bad() {
        let (id, command) = decode_request(&json!({"type": "stream.unsubscribe", "requestId": "r9"}));
        assert_eq!(id.as_deref(), Some("r9"));
        assert!(command.is_err());

        let (_, command) = decode_request(&json!({
            "type": "stream.unsubscribe",
            "subscriptionId": "sub-1",
            "requestId": "r10",
        }));
        assert_eq!(
            command.unwrap(),
            StreamCommand::Unsubscribe {
                subscription_id: "sub-1".into()
            }
        );
    }

    #[test]
    fn subscribe_response_requires_non_empty_string_id() {
        for bad in [
            json!({}),
            json!({"subscriptionId": ""}),
            json!({"subscriptionId": 42}),
            json!({"subscriptionId": null, "cursor": 3}),
        ] {
            assert!(matches!(
                parse_subscribe_response(&bad),
                Err(StreamError::MalformedSubscriptionId)
            ));
        }
    }

    #[test]
    fn subscribe_response_tolerates_missing_or_odd_cursor() {
        let ack = parse_subscribe_response(&json!({"subscriptionId": "s", "cursor": 12})).unwrap();
        assert_eq!(ack.cursor, Some(12));
        let ack = parse_subscribe_response(&json!({"subscriptionId": "s"})).unwrap();
        assert_eq!(ack.cursor, None);
        let ack = parse_subscribe_response(&json!({"subscriptionId": "s", "cursor": "12"})).unwrap();
        assert_eq!(ack.cursor, None);
    }

    #[test]
    fn server_frames_are_tagged() {
        let event = ServerFrame::Event(StreamDelivery {
            subscription_id: "sub-1".into(),
            cursor: 4,
            event: json!({"type": "task-deleted", "taskId": "t1"}),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "stream.event",
                "subscriptionId": "sub-1",
                "cursor": 4,
                "event": {"type": "task-deleted", "taskId": "t1"},
            })
        );

        let err = ServerFrame::error(
            Some("r1".into()),
            ProtocolError::from(&StreamError::MalformedSubscriptionId),
        );
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "malformed_subscription_id");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn observed_events_parse_known_and_unknown_kinds() {
        assert_eq!(
            ObservedEvent::from_value(&json!({
                "type": "repository-archived",
                "repositoryId": "r1",
                "ts": "2026-01-01T00:00:00Z",
            })),
            Some(ObservedEvent::RepositoryArchived {
                repository_id: "r1".into(),
                ts: "2026-01-01T00:00:00Z".into(),
            })
        );
        assert_eq!(
            ObservedEvent::from_value(&json!({"type": "pane-focused", "paneId": 3})),
            Some(ObservedEvent::Unknown)
        );
        assert_eq!(
            ObservedEvent::from_value(&json!({"type": "task-deleted"})),
            None
        );
        assert_eq!(
            ObservedEvent::from_value(&json!({"type": "task-updated"})),
            Some(ObservedEvent::TaskUpdated { task: Value::Null })
        );
    }

    #[test]
    fn session_output_chunk_round_trips_through_base64() {
        let event = session_output_event("s1", b"\x1b[1mhi\xff");
        assert_eq!(event["type"], "session-output");
        assert_eq!(decode_session_chunk(&event).unwrap(), b"\x1b[1mhi\xff");
        assert_eq!(decode_session_chunk(&json!({"type": "session-exit"})), None);
    }
}
