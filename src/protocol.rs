//! Wire protocol between the client and the bridge.
//!
//! Every line on the wire is one JSON [`Envelope`]:
//! `{"type": "...", "id": "...", "session_id": "...", "payload": {...}}`.
//! Inbound envelopes are decoded into a [`Command`]; outbound ones are built
//! from an [`Outbound`].

use crate::runtime::PermissionContext;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

/// Errors decoding an inbound envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} requires a session_id")]
    MissingSessionId { kind: &'static str },

    #[error("{kind} requires an id")]
    MissingId { kind: &'static str },
}

/// One self-contained unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl Envelope {
    /// Parse one line from the wire.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(ProtocolError::Malformed)
    }

    /// Serialize to a single wire line (without the trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("Envelope serialization should never fail")
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Payload of `session.create`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreateSession {
    /// Initial user turn, string or content blocks.
    #[serde(default, alias = "content")]
    pub prompt: Option<Value>,
    /// Working directory for the conversation.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Opaque options forwarded to the runtime.
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Payload of `session.send`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendMessage {
    #[serde(alias = "content")]
    pub message: Value,
}

/// Payload of `query.call`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryCall {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create(CreateSession),
    Send {
        session_id: String,
        message: SendMessage,
    },
    Interrupt {
        session_id: String,
    },
    Kill {
        session_id: String,
    },
    CallbackResponse {
        session_id: String,
        callback_id: String,
        payload: Value,
    },
    Query {
        session_id: String,
        call: QueryCall,
    },
}

impl Command {
    pub const CREATE: &'static str = "session.create";
    pub const SEND: &'static str = "session.send";
    pub const INTERRUPT: &'static str = "session.interrupt";
    pub const KILL: &'static str = "session.kill";
    pub const CALLBACK_RESPONSE: &'static str = "callback.response";
    pub const QUERY: &'static str = "query.call";

    /// Decode the command carried by an inbound envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let session_id = |kind| {
            envelope
                .session_id
                .clone()
                .ok_or(ProtocolError::MissingSessionId { kind })
        };

        match envelope.kind.as_str() {
            Self::CREATE => Ok(Self::Create(payload(Self::CREATE, &envelope.payload)?)),
            Self::SEND => Ok(Self::Send {
                session_id: session_id(Self::SEND)?,
                message: payload(Self::SEND, &envelope.payload)?,
            }),
            Self::INTERRUPT => Ok(Self::Interrupt {
                session_id: session_id(Self::INTERRUPT)?,
            }),
            Self::KILL => Ok(Self::Kill {
                session_id: session_id(Self::KILL)?,
            }),
            Self::CALLBACK_RESPONSE => Ok(Self::CallbackResponse {
                session_id: session_id(Self::CALLBACK_RESPONSE)?,
                callback_id: envelope.id.clone().ok_or(ProtocolError::MissingId {
                    kind: Self::CALLBACK_RESPONSE,
                })?,
                payload: envelope.payload.clone(),
            }),
            Self::QUERY => Ok(Self::Query {
                session_id: session_id(Self::QUERY)?,
                call: payload(Self::QUERY, &envelope.payload)?,
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn payload<T: for<'de> Deserialize<'de>>(
    kind: &'static str,
    value: &Value,
) -> Result<T, ProtocolError> {
    T::deserialize(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// Error codes carried by outbound `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    SessionNotFound,
    SessionCreateFailed,
    SendMessageFailed,
    InterruptFailed,
    RuntimeError,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionCreateFailed => "SESSION_CREATE_FAILED",
            Self::SendMessageFailed => "SEND_MESSAGE_FAILED",
            Self::InterruptFailed => "INTERRUPT_FAILED",
            Self::RuntimeError => "RUNTIME_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `callback.request`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "callback_type", rename_all = "snake_case")]
pub enum CallbackRequest {
    CanUseTool {
        tool_name: String,
        tool_input: Value,
        #[serde(flatten)]
        context: PermissionContext,
    },
    Hook {
        hook_event: String,
        hook_input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
}

/// Payload of `query.result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    #[must_use]
    pub const fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Messages the bridge sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    SessionCreated,
    SessionInterrupted,
    SessionKilled,
    /// An opaque runtime output item.
    SdkMessage(Value),
    CallbackRequest(CallbackRequest),
    QueryResult(QueryResult),
    Error { code: ErrorCode, message: String },
}

impl Outbound {
    /// Create an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// The wire `type` of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionInterrupted => "session.interrupted",
            Self::SessionKilled => "session.killed",
            Self::SdkMessage(_) => "sdk.message",
            Self::CallbackRequest(_) => "callback.request",
            Self::QueryResult(_) => "query.result",
            Self::Error { .. } => "error",
        }
    }

    /// Wrap into an envelope with the given correlation and session ids.
    #[must_use]
    pub fn into_envelope(self, id: Option<String>, session_id: Option<String>) -> Envelope {
        let kind = self.kind().to_string();
        let payload = match self {
            Self::SessionCreated | Self::SessionInterrupted | Self::SessionKilled => {
                empty_object()
            }
            Self::SdkMessage(item) => item,
            Self::CallbackRequest(request) => serde_json::to_value(request)
                .expect("CallbackRequest serialization should never fail"),
            Self::QueryResult(result) => {
                serde_json::to_value(result).expect("QueryResult serialization should never fail")
            }
            Self::Error { code, message } => json!({ "code": code, "message": message }),
        };
        Envelope {
            kind,
            id,
            session_id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Result<Command, ProtocolError> {
        Command::from_envelope(&Envelope::parse(line).expect("parse"))
    }

    #[test]
    fn test_create_accepts_prompt_or_content() {
        let cmd = command(
            r#"{"type":"session.create","id":"r1","payload":{"prompt":"hi","cwd":"/tmp"}}"#,
        )
        .expect("decode");
        let Command::Create(create) = cmd else {
            panic!("expected create, got {cmd:?}");
        };
        assert_eq!(create.prompt, Some(json!("hi")));
        assert_eq!(create.cwd.as_deref(), Some("/tmp"));
        assert!(create.options.is_empty());

        let cmd = command(
            r#"{"type":"session.create","payload":{"content":[{"type":"text","text":"hi"}],"options":{"model":"opus"}}}"#,
        )
        .expect("decode");
        let Command::Create(create) = cmd else {
            panic!("expected create, got {cmd:?}");
        };
        assert_eq!(create.prompt, Some(json!([{"type": "text", "text": "hi"}])));
        assert_eq!(create.options.get("model"), Some(&json!("opus")));
    }

    #[test]
    fn test_send_accepts_message_or_content() {
        for line in [
            r#"{"type":"session.send","session_id":"s","payload":{"message":"next"}}"#,
            r#"{"type":"session.send","session_id":"s","payload":{"content":"next"}}"#,
        ] {
            assert_eq!(
                command(line).expect("decode"),
                Command::Send {
                    session_id: "s".into(),
                    message: SendMessage {
                        message: json!("next")
                    },
                }
            );
        }
    }

    #[test]
    fn test_missing_payload_defaults_to_empty_object() {
        let envelope =
            Envelope::parse(r#"{"type":"session.kill","session_id":"s"}"#).expect("parse");
        assert_eq!(envelope.payload, json!({}));
        assert_eq!(
            Command::from_envelope(&envelope).expect("decode"),
            Command::Kill {
                session_id: "s".into()
            }
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            command(r#"{"type":"session.explode","payload":{}}"#),
            Err(ProtocolError::UnknownType(t)) if t == "session.explode"
        ));
        assert!(matches!(
            command(r#"{"type":"session.interrupt"}"#),
            Err(ProtocolError::MissingSessionId { .. })
        ));
        assert!(matches!(
            command(r#"{"type":"callback.response","session_id":"s","payload":{}}"#),
            Err(ProtocolError::MissingId { .. })
        ));
        assert!(matches!(
            command(r#"{"type":"session.send","session_id":"s","payload":{}}"#),
            Err(ProtocolError::InvalidPayload { kind: "session.send", .. })
        ));
        assert!(matches!(
            Envelope::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_callback_request_payload_shape() {
        let envelope = Outbound::CallbackRequest(CallbackRequest::CanUseTool {
            tool_name: "Bash".into(),
            tool_input: json!({"command": "ls"}),
            context: PermissionContext {
                blocked_path: Some("/etc".into()),
                ..PermissionContext::default()
            },
        })
        .into_envelope(Some("cb1".into()), Some("s".into()));

        assert_eq!(envelope.kind, "callback.request");
        assert_eq!(
            envelope.payload,
            json!({
                "callback_type": "can_use_tool",
                "tool_name": "Bash",
                "tool_input": {"command": "ls"},
                "blocked_path": "/etc",
            })
        );

        let hook = Outbound::CallbackRequest(CallbackRequest::Hook {
            hook_event: "PreToolUse".into(),
            hook_input: json!({"tool_name": "Bash"}),
            tool_use_id: None,
        })
        .into_envelope(Some("cb2".into()), Some("s".into()));
        assert_eq!(
            hook.payload,
            json!({"callback_type": "hook", "hook_event": "PreToolUse", "hook_input": {"tool_name": "Bash"}})
        );
    }

    #[test]
    fn test_error_envelope_line() {
        let line = Outbound::error(ErrorCode::SessionNotFound, "session not found: x")
            .into_envelope(Some("r9".into()), None)
            .to_line();
        let parsed: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(
            parsed,
            json!({
                "type": "error",
                "id": "r9",
                "payload": {"code": "SESSION_NOT_FOUND", "message": "session not found: x"},
            })
        );
    }
}
