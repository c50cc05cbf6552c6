//! Command-line interface for agent-bridge.

use crate::runtime::process::DEFAULT_HOOK_EVENTS;
use clap::Parser;
use std::path::PathBuf;

/// Get the default socket path for `--listen`.
///
/// Uses `$XDG_RUNTIME_DIR/agent-bridge.sock` if available, otherwise
/// `/tmp/agent-bridge-$UID.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("agent-bridge.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/agent-bridge-{uid}.sock"))
    }
}

/// Bridge between a line-oriented JSON control protocol and agent runtime
/// conversations.
#[derive(Debug, Parser)]
#[command(name = "agent-bridge", version, about)]
pub struct Cli {
    /// Agent CLI to spawn for each session.
    #[arg(long, env = "AGENT_BRIDGE_RUNTIME_COMMAND", default_value = "claude")]
    pub runtime_command: PathBuf,

    /// Extra argument passed to the agent CLI (repeatable).
    #[arg(long = "runtime-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub runtime_args: Vec<String>,

    /// Seconds to wait for the client to answer a callback.
    #[arg(long, env = "AGENT_BRIDGE_CALLBACK_TIMEOUT_SECS", default_value = "300")]
    pub callback_timeout_secs: u64,

    /// Hook event forwarded to the client (repeatable).
    #[arg(
        long = "hook-event",
        value_name = "EVENT",
        default_values_t = DEFAULT_HOOK_EVENTS.map(String::from)
    )]
    pub hook_events: Vec<String>,

    /// Append every wire line to this JSON Lines file.
    #[arg(long, env = "AGENT_BRIDGE_TRAFFIC_LOG")]
    pub traffic_log: Option<PathBuf>,

    /// Serve one client on a Unix socket instead of stdio.
    #[arg(long)]
    pub listen: bool,

    /// Path to the Unix socket used with `--listen`.
    #[arg(long, env = "AGENT_BRIDGE_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}
