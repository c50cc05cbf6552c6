//! The agent runtime boundary.
//!
//! The bridge never looks inside a conversation. It hands the runtime a
//! pull-based stream of user messages plus a [`RuntimeCallbacks`] capability,
//! and gets back a stream of opaque output items and a [`ConversationControl`]
//! handle for interrupts and control queries.

pub mod process;

pub use process::{ProcessRuntime, ProcessRuntimeConfig};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by an agent runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn runtime process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("runtime I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("runtime protocol error: {0}")]
    Protocol(String),

    #[error("runtime exited with status {0:?}")]
    Exited(Option<i32>),

    #[error("runtime rejected control request: {0}")]
    ControlRejected(String),

    #[error("control request timed out: {0}")]
    ControlTimeout(String),

    #[error("runtime connection closed")]
    Closed,

    #[error("invalid arguments for {method}: {message}")]
    InvalidArguments { method: &'static str, message: String },
}

/// Errors delivered to the runtime instead of a callback result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("session terminated")]
    SessionTerminated,
}

/// One user turn pushed into a conversation.
///
/// `content` is forwarded untouched: either a plain string or an array of
/// content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Value,
}

impl UserMessage {
    #[must_use]
    pub const fn new(content: Value) -> Self {
        Self { content }
    }

    /// Convenience for a plain-text turn.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Value::String(text.into()))
    }
}

/// Context the runtime attaches to a tool permission check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionContext {
    /// Permission rule updates the runtime proposes alongside the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl PermissionContext {
    /// Whether the runtime proposed any permission updates.
    #[must_use]
    pub fn has_suggestions(&self) -> bool {
        self.suggestions.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Outcome of a tool permission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow {
        #[serde(
            rename = "updatedInput",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        updated_input: Option<Value>,
        #[serde(
            rename = "updatedPermissions",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        updated_permissions: Option<Vec<Value>>,
    },
    Deny {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interrupt: Option<bool>,
    },
}

impl PermissionDecision {
    /// A denial with the given message.
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: None,
        }
    }

    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Result of a lifecycle hook. The empty value means "no opinion, continue".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    #[serde(
        rename = "continue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub continue_: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<Value>,
}

impl HookOutput {
    /// True when the hook expressed no opinion at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Control methods a client may invoke on a live conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    SetModel,
    SetPermissionMode,
    SetMaxThinkingTokens,
    SupportedModels,
    SupportedCommands,
    McpServerStatus,
    AccountInfo,
}

impl QueryMethod {
    pub const ALL: [Self; 7] = [
        Self::SetModel,
        Self::SetPermissionMode,
        Self::SetMaxThinkingTokens,
        Self::SupportedModels,
        Self::SupportedCommands,
        Self::McpServerStatus,
        Self::AccountInfo,
    ];

    /// Look up an allow-listed method by its wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SetModel => "setModel",
            Self::SetPermissionMode => "setPermissionMode",
            Self::SetMaxThinkingTokens => "setMaxThinkingTokens",
            Self::SupportedModels => "supportedModels",
            Self::SupportedCommands => "supportedCommands",
            Self::McpServerStatus => "mcpServerStatus",
            Self::AccountInfo => "accountInfo",
        }
    }
}

impl std::fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callbacks the runtime invokes while a conversation is live. The client
/// answers them out-of-band, so every call may suspend for a long time.
#[async_trait]
pub trait RuntimeCallbacks: Send + Sync {
    /// Ask whether `tool_name` may run with `tool_input`.
    async fn can_use_tool(
        &self,
        tool_name: String,
        tool_input: Value,
        context: PermissionContext,
    ) -> Result<PermissionDecision, CallbackError>;

    /// Run the lifecycle hook registered for `event`.
    async fn hook(
        &self,
        event: String,
        input: Value,
        tool_use_id: Option<String>,
    ) -> Result<HookOutput, CallbackError>;
}

/// Control surface of a live conversation.
#[async_trait]
pub trait ConversationControl: Send + Sync {
    /// Interrupt the current turn and wait for the runtime to acknowledge.
    async fn interrupt(&self) -> Result<(), RuntimeError>;

    /// Invoke an allow-listed control method.
    async fn call(&self, method: QueryMethod, args: Value) -> Result<Value, RuntimeError>;
}

/// Everything the runtime needs to open a conversation.
pub struct StartRequest {
    pub input: BoxStream<'static, UserMessage>,
    pub cwd: PathBuf,
    /// Opaque options bag from `session.create`.
    pub options: Map<String, Value>,
    pub callbacks: Arc<dyn RuntimeCallbacks>,
}

/// A running conversation.
pub struct Conversation {
    /// Output items in emission order. An `Err` ends the stream.
    pub messages: BoxStream<'static, Result<Value, RuntimeError>>,
    pub control: Arc<dyn ConversationControl>,
}

/// An engine able to open conversations.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn start(&self, request: StartRequest) -> Result<Conversation, RuntimeError>;
}

/// The runtime-assigned conversation id carried by an output item, if any.
#[must_use]
pub fn conversation_id(item: &Value) -> Option<&str> {
    item.get("session_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}
