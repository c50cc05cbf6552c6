//! The bridge server.
//!
//! Reads envelopes line by line from the client, hands them to the
//! [`Router`], and writes every outbound envelope from a single writer task.
//! The client is either the process's own stdio or one connection accepted on
//! a Unix socket.

mod callbacks;
mod manager;
mod queue;
mod router;
mod session;
mod traffic;

pub use callbacks::{CallbackRegistry, DEFAULT_CALLBACK_TIMEOUT, PERMISSION_TIMEOUT_MESSAGE};
pub use manager::SessionManager;
pub use queue::{InputQueue, QueueError};
pub use router::{Router, RouterEvent};
pub use session::{Session, SessionError, SessionSettings, SessionState};
pub use traffic::{Direction, TrafficLog, TrafficLogError};

use crate::protocol::Envelope;
use crate::runtime::AgentRuntime;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error(transparent)]
    TrafficLog(#[from] TrafficLogError),
}

/// Sending half of the single outbound channel.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    /// Create an outbox and the receiver the writer drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an envelope for the client. Dropped if the writer is gone.
    pub fn send(&self, envelope: Envelope) {
        if let Err(e) = self.tx.send(envelope) {
            debug!(kind = %e.0.kind, "Outbound channel closed, dropping envelope");
        }
    }
}

/// Server construction options.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub session: SessionSettings,
    /// Where to log wire traffic, if anywhere.
    pub traffic_log: Option<PathBuf>,
}

/// The bridge server.
pub struct Server {
    runtime: Arc<dyn AgentRuntime>,
    options: ServerOptions,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a server driving conversations on `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<dyn AgentRuntime>, options: ServerOptions) -> Self {
        Self {
            runtime,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// A token that stops the server when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request server shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve the client on stdin/stdout.
    pub async fn serve_stdio(&self) -> Result<(), ServerError> {
        info!("Serving on stdio");
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Accept one client on a Unix socket and serve it until it disconnects.
    pub async fn serve_socket(&self, socket_path: &Path) -> Result<(), ServerError> {
        // Security: Check for symlink attack before removing existing socket
        if socket_path.exists() {
            let metadata = std::fs::symlink_metadata(socket_path).map_err(ServerError::Io)?;

            if metadata.file_type().is_symlink() {
                return Err(ServerError::Bind(std::io::Error::other(
                    "socket path is a symlink - possible security attack",
                )));
            }

            // Only remove if it's a socket (or we can't tell)
            if metadata.file_type().is_socket() || metadata.file_type().is_file() {
                std::fs::remove_file(socket_path).ok();
            }
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(ServerError::Io)?;
        }

        let listener = UnixListener::bind(socket_path).map_err(ServerError::Bind)?;

        // Security: Set socket permissions to owner-only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(socket_path, perms).map_err(ServerError::Io)?;
        }

        info!("Listening on {:?}", socket_path);

        let result = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    info!("Client connected");
                    let (reader, writer) = stream.into_split();
                    self.run(reader, writer).await
                }
                Err(e) => Err(ServerError::Accept(e)),
            },
            () = self.shutdown.cancelled() => {
                info!("Shutdown before any client connected");
                Ok(())
            }
        };

        std::fs::remove_file(socket_path).ok();
        result
    }

    /// Serve one client until its input ends or shutdown is requested.
    ///
    /// On exit every live session is killed and the traffic log is flushed.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let traffic = match &self.options.traffic_log {
            Some(path) => {
                let log = TrafficLog::open(path)?;
                info!(path = %log.path().display(), "Logging wire traffic");
                Some(Arc::new(log))
            }
            None => None,
        };

        let (outbox, outbound_rx) = Outbox::channel();
        let writer_stop = CancellationToken::new();
        let writer_task = tokio::spawn(write_outbound(
            writer,
            outbound_rx,
            writer_stop.clone(),
            traffic.clone(),
        ));

        let (mut router, mut events) = Router::new(
            Arc::clone(&self.runtime),
            self.options.session.clone(),
            outbox,
        );

        let mut lines = BufReader::new(reader).lines();
        let result = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(traffic) = &traffic {
                            traffic.record(Direction::In, &line);
                        }
                        router.handle_line(&line);
                    }
                    Ok(None) => {
                        info!("Input closed");
                        break Ok(());
                    }
                    Err(e) => {
                        error!("Read error: {}", e);
                        break Err(ServerError::Io(e));
                    }
                },
                Some(event) = events.recv() => router.handle_event(event),
                () = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break Ok(());
                }
            }
        };

        router.shutdown();
        drop(router);

        writer_stop.cancel();
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Writer stopped with error: {}", e),
            Err(e) => warn!("Writer task failed: {}", e),
        }

        if let Some(traffic) = &traffic {
            traffic.flush()?;
        }
        info!("Server shut down");
        result
    }
}

/// Write outbound envelopes, one per line, until stopped. Envelopes already
/// queued when the stop arrives are still written.
async fn write_outbound<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    stop: CancellationToken,
    traffic: Option<Arc<TrafficLog>>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;
            envelope = rx.recv() => envelope,
            () = stop.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        let Some(envelope) = envelope else {
            break;
        };

        let mut line = envelope.to_line();
        if let Some(traffic) = &traffic {
            traffic.record(Direction::Out, &line);
        }
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Outbound;

    #[tokio::test]
    async fn test_writer_drains_queue_on_stop() {
        let (outbox, rx) = Outbox::channel();
        let stop = CancellationToken::new();
        let (client, server_side) = tokio::io::duplex(4096);

        outbox.send(Outbound::SessionKilled.into_envelope(Some("k1".into()), Some("s1".into())));
        outbox.send(Outbound::SessionCreated.into_envelope(None, Some("s2".into())));
        stop.cancel();

        write_outbound(server_side, rx, stop, None).await.unwrap();
        // Sends after the writer stopped are dropped quietly.
        outbox.send(Outbound::SessionKilled.into_envelope(None, None));

        let mut lines = BufReader::new(client).lines();
        let first = Envelope::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.kind, "session.killed");
        assert_eq!(first.id.as_deref(), Some("k1"));
        let second = Envelope::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.kind, "session.created");
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_removes_socket() {
        let runtime = Arc::new(crate::testing::ScriptedRuntime::new());
        let server = Server::new(runtime, ServerOptions::default());
        let path = std::env::temp_dir().join(format!(
            "agent-bridge-server-test-{}.sock",
            std::process::id()
        ));

        server.shutdown();
        server.serve_socket(&path).await.unwrap();
        assert!(!path.exists());
    }
}
