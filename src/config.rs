//! Resolved bridge configuration.

use crate::cli::{Cli, default_socket_path};
use crate::runtime::ProcessRuntimeConfig;
use crate::server::{ServerOptions, SessionSettings};
use std::path::PathBuf;
use std::time::Duration;

/// Where the bridge talks to its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Socket(PathBuf),
}

/// Everything `main` needs to build and run the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub transport: Transport,
    pub server: ServerOptions,
    pub runtime: ProcessRuntimeConfig,
    pub verbose: bool,
}

impl BridgeConfig {
    /// The tracing filter used when `RUST_LOG` is unset.
    #[must_use]
    pub const fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "agent_bridge=debug"
        } else {
            "agent_bridge=info"
        }
    }
}

impl From<Cli> for BridgeConfig {
    fn from(cli: Cli) -> Self {
        let transport = if cli.listen {
            Transport::Socket(cli.socket.unwrap_or_else(default_socket_path))
        } else {
            Transport::Stdio
        };

        Self {
            transport,
            server: ServerOptions {
                session: SessionSettings {
                    callback_timeout: Duration::from_secs(cli.callback_timeout_secs),
                },
                traffic_log: cli.traffic_log,
            },
            runtime: ProcessRuntimeConfig {
                command: cli.runtime_command,
                args: cli.runtime_args,
                hook_events: cli.hook_events,
                ..ProcessRuntimeConfig::default()
            },
            verbose: cli.verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(args: &[&str]) -> BridgeConfig {
        let argv = std::iter::once("agent-bridge").chain(args.iter().copied());
        BridgeConfig::from(Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_stdio_by_default() {
        let config = config(&[]);
        assert_eq!(config.transport, Transport::Stdio);
        assert_eq!(
            config.server.session.callback_timeout,
            Duration::from_secs(300)
        );
        assert_eq!(config.default_log_filter(), "agent_bridge=info");
    }

    #[test]
    fn test_listen_uses_socket_path() {
        let config = config(&["--listen", "--socket", "/tmp/bridge-test.sock", "-v"]);
        assert_eq!(
            config.transport,
            Transport::Socket(PathBuf::from("/tmp/bridge-test.sock"))
        );
        assert_eq!(config.default_log_filter(), "agent_bridge=debug");
    }

    #[test]
    fn test_runtime_settings_carried_over() {
        let config = config(&[
            "--runtime-command",
            "agent",
            "--runtime-arg",
            "--fast",
            "--hook-event",
            "Stop",
            "--callback-timeout-secs",
            "7",
            "--traffic-log",
            "/tmp/traffic.jsonl",
        ]);
        assert_eq!(config.runtime.command, PathBuf::from("agent"));
        assert_eq!(config.runtime.args, vec!["--fast"]);
        assert_eq!(config.runtime.hook_events, vec!["Stop"]);
        assert_eq!(config.server.session.callback_timeout, Duration::from_secs(7));
        assert_eq!(
            config.server.traffic_log,
            Some(PathBuf::from("/tmp/traffic.jsonl"))
        );
    }
}
