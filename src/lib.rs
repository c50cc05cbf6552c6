//! agent-bridge: session bridge for agent runtimes
//!
//! Multiplexes agent conversations over a line-oriented JSON protocol: one
//! client creates sessions, streams messages into them, and answers the
//! permission and hook callbacks each conversation raises.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod testing;

pub use cli::{Cli, default_socket_path};
pub use config::{BridgeConfig, Transport};
pub use protocol::{Command, Envelope, ErrorCode, Outbound, ProtocolError};
pub use runtime::{
    AgentRuntime, Conversation, ConversationControl, ProcessRuntime, ProcessRuntimeConfig,
    RuntimeCallbacks, RuntimeError,
};
pub use server::{Server, ServerError, ServerOptions};
pub use testing::{ScriptedConversation, ScriptedRuntime, TestError, TestHarness};
