//! Dispatch of inbound envelopes to sessions.

use super::Outbox;
use super::manager::SessionManager;
use super::session::{Session, SessionError, SessionSettings};
use crate::protocol::{
    Command, CreateSession, Envelope, ErrorCode, Outbound, QueryCall, QueryResult,
};
use crate::runtime::{AgentRuntime, QueryMethod};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Completions reported back to the router by tasks it spawned.
pub enum RouterEvent {
    /// A session finished starting and may be registered.
    Started {
        request_id: Option<String>,
        session: Box<Session>,
    },
    /// Starting a session failed.
    StartFailed {
        request_id: Option<String>,
        session_id: String,
        error: SessionError,
    },
    /// A session's run loop exited.
    Finished { session_id: String },
}

/// The process-wide table of live sessions and the envelope dispatcher.
///
/// Only the router's owner mutates the table; spawned work reports back
/// through [`RouterEvent`]s.
pub struct Router {
    runtime: Arc<dyn AgentRuntime>,
    settings: SessionSettings,
    outbox: Outbox,
    sessions: SessionManager,
    events_tx: mpsc::UnboundedSender<RouterEvent>,
    shutting_down: bool,
}

impl Router {
    /// Create a router. The caller must feed every event from the returned
    /// receiver back into [`Router::handle_event`].
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        settings: SessionSettings,
        outbox: Outbox,
    ) -> (Self, mpsc::UnboundedReceiver<RouterEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = Self {
            runtime,
            settings,
            outbox,
            sessions: SessionManager::new(),
            events_tx,
            shutting_down: false,
        };
        (router, events_rx)
    }

    /// Handle one raw line from the wire.
    pub fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match Envelope::parse(line) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                warn!(error = %e, "Invalid envelope");
                self.reply(
                    None,
                    None,
                    Outbound::error(ErrorCode::InvalidMessage, e.to_string()),
                );
            }
        }
    }

    /// Dispatch one inbound envelope.
    pub fn dispatch(&mut self, envelope: Envelope) {
        let command = match Command::from_envelope(&envelope) {
            Ok(command) => command,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "Rejected envelope");
                self.reply(
                    envelope.id,
                    envelope.session_id,
                    Outbound::error(ErrorCode::InvalidMessage, e.to_string()),
                );
                return;
            }
        };

        debug!(kind = %envelope.kind, id = ?envelope.id, session_id = ?envelope.session_id, "Received envelope");
        let request_id = envelope.id;

        match command {
            Command::Create(create) => self.create(request_id, create),
            Command::Send {
                session_id,
                message,
            } => self.send(request_id, &session_id, message.message),
            Command::Interrupt { session_id } => self.interrupt(request_id, &session_id),
            Command::Kill { session_id } => self.kill(request_id, &session_id),
            Command::CallbackResponse {
                session_id,
                callback_id,
                payload,
            } => self.callback_response(&session_id, &callback_id, &payload),
            Command::Query { session_id, call } => self.query(request_id, &session_id, call),
        }
    }

    fn reply(&self, id: Option<String>, session_id: Option<String>, message: Outbound) {
        self.outbox.send(message.into_envelope(id, session_id));
    }

    fn not_found(&self, request_id: Option<String>, session_id: &str) {
        debug!(%session_id, "Session not found");
        self.reply(
            request_id,
            Some(session_id.to_string()),
            Outbound::error(
                ErrorCode::SessionNotFound,
                format!("session not found: {session_id}"),
            ),
        );
    }

    fn create(&mut self, request_id: Option<String>, create: CreateSession) {
        if self.shutting_down {
            self.reply(
                request_id,
                None,
                Outbound::error(ErrorCode::SessionCreateFailed, "bridge is shutting down"),
            );
            return;
        }

        let session_id = self.sessions.allocate_id();
        let runtime = Arc::clone(&self.runtime);
        let outbox = self.outbox.clone();
        let settings = self.settings.clone();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let event = match Session::start(
                session_id.clone(),
                create,
                runtime.as_ref(),
                outbox,
                &settings,
            )
            .await
            {
                Ok(session) => RouterEvent::Started {
                    request_id,
                    session: Box::new(session),
                },
                Err(error) => RouterEvent::StartFailed {
                    request_id,
                    session_id,
                    error,
                },
            };
            let _ = events.send(event);
        });
    }

    fn send(&self, request_id: Option<String>, session_id: &str, content: Value) {
        let Some(session) = self.sessions.get(session_id) else {
            self.not_found(request_id, session_id);
            return;
        };
        if let Err(e) = session.send(content) {
            warn!(%session_id, error = %e, "Send failed");
            self.reply(
                request_id,
                Some(session_id.to_string()),
                Outbound::error(e.code(), e.to_string()),
            );
        }
    }

    fn interrupt(&self, request_id: Option<String>, session_id: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            self.not_found(request_id, session_id);
            return;
        };

        let interrupt = session.interrupt();
        let outbox = self.outbox.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let message = match interrupt.await {
                Ok(()) => Outbound::SessionInterrupted,
                Err(e) => Outbound::error(e.code(), e.to_string()),
            };
            outbox.send(message.into_envelope(request_id, Some(session_id)));
        });
    }

    fn kill(&mut self, request_id: Option<String>, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            self.not_found(request_id, session_id);
            return;
        };
        session.kill();
        self.reply(
            request_id,
            Some(session_id.to_string()),
            Outbound::SessionKilled,
        );
    }

    fn callback_response(&self, session_id: &str, callback_id: &str, payload: &Value) {
        let Some(session) = self.sessions.get(session_id) else {
            self.not_found(Some(callback_id.to_string()), session_id);
            return;
        };
        session.resolve_callback(callback_id, payload);
    }

    fn query(&self, request_id: Option<String>, session_id: &str, call: QueryCall) {
        let Some(session) = self.sessions.get(session_id) else {
            self.reply(
                request_id,
                Some(session_id.to_string()),
                Outbound::QueryResult(QueryResult::err(format!(
                    "session not found: {session_id}"
                ))),
            );
            return;
        };
        let Some(method) = QueryMethod::parse(&call.method) else {
            self.reply(
                request_id,
                Some(session_id.to_string()),
                Outbound::QueryResult(QueryResult::err(format!(
                    "unsupported query method: {}",
                    call.method
                ))),
            );
            return;
        };

        let query = session.query(method, call.args);
        let outbox = self.outbox.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = match query.await {
                Ok(value) => QueryResult::ok(value),
                Err(e) => QueryResult::err(e.to_string()),
            };
            outbox.send(Outbound::QueryResult(result).into_envelope(request_id, Some(session_id)));
        });
    }

    /// Apply a completion reported by a spawned task.
    pub fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Started {
                request_id,
                mut session,
            } => {
                if self.shutting_down {
                    session.kill();
                    return;
                }
                let session_id = session.id.clone();
                // Announce before the run loop can emit anything for this session.
                self.reply(
                    request_id,
                    Some(session_id.clone()),
                    Outbound::SessionCreated,
                );
                let events = self.events_tx.clone();
                let finished_id = session_id.clone();
                session.spawn_run_loop(self.outbox.clone(), move || {
                    let _ = events.send(RouterEvent::Finished {
                        session_id: finished_id,
                    });
                });
                self.sessions.add(*session);
                info!(%session_id, live = self.sessions.len(), "Session registered");
            }
            RouterEvent::StartFailed {
                request_id,
                session_id,
                error,
            } => {
                warn!(%session_id, error = %error, "Session create failed");
                self.reply(request_id, None, Outbound::error(error.code(), error.to_string()));
            }
            RouterEvent::Finished { session_id } => {
                if let Some(session) = self.sessions.remove(&session_id) {
                    session.kill();
                    info!(%session_id, live = self.sessions.len(), "Session removed after run loop exit");
                }
            }
        }
    }

    /// Kill every live session. Further creates are refused.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        let sessions = self.sessions.drain();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Killing live sessions");
        }
        for session in sessions {
            session.kill();
        }
    }

    /// Whether a session is currently registered.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.get(session_id).is_some()
    }

    /// Ids of every live session.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.list().map(|s| s.id.clone()).collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
