//! One live agent conversation.

use super::Outbox;
use super::callbacks::CallbackRegistry;
use super::queue::{InputQueue, QueueError};
use crate::protocol::{CreateSession, ErrorCode, Outbound};
use crate::runtime::{
    self, AgentRuntime, ConversationControl, QueryMethod, RuntimeError, StartRequest, UserMessage,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start runtime: {0}")]
    Start(#[source] RuntimeError),

    #[error("failed to send message: {0}")]
    Send(#[source] QueueError),

    #[error("interrupt failed: {0}")]
    Interrupt(#[source] RuntimeError),

    #[error("{method} failed: {source}")]
    Query {
        method: QueryMethod,
        #[source]
        source: RuntimeError,
    },

    #[error("working directory unavailable: {0}")]
    Cwd(#[source] std::io::Error),
}

impl SessionError {
    /// The wire error code reported for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Start(_) | Self::Cwd(_) => ErrorCode::SessionCreateFailed,
            Self::Send(_) => ErrorCode::SendMessageFailed,
            Self::Interrupt(_) => ErrorCode::InterruptFailed,
            Self::Query { .. } => ErrorCode::RuntimeError,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Interrupting,
    Killed,
    Completed,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Killed | Self::Completed)
    }
}

/// Shared, lock-protected session state. Terminal states are sticky.
#[derive(Clone)]
struct StateCell(Arc<Mutex<SessionState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionState::Starting)))
    }

    fn get(&self) -> SessionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless already terminal. Returns the previous state.
    fn set(&self, next: SessionState) -> SessionState {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        if !previous.is_terminal() {
            *state = next;
        }
        previous
    }
}

/// Per-session settings shared by every session the router creates.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub callback_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            callback_timeout: super::callbacks::DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

/// A live conversation and every resource scoped to it.
pub struct Session {
    /// Bridge-assigned session id.
    pub id: String,
    /// Working directory the runtime was started in.
    pub cwd: PathBuf,
    /// When the session was created.
    pub started_at: Instant,
    cancel: CancellationToken,
    queue: InputQueue<UserMessage>,
    callbacks: Arc<CallbackRegistry>,
    control: Arc<dyn ConversationControl>,
    conversation_id: Arc<OnceLock<String>>,
    state: StateCell,
    /// Runtime output, held until the run loop takes it.
    messages: Option<BoxStream<'static, Result<Value, RuntimeError>>>,
}

impl Session {
    /// Open a runtime conversation for a `session.create` request.
    ///
    /// The run loop is not started yet; see [`Session::spawn_run_loop`].
    pub async fn start(
        id: String,
        request: CreateSession,
        runtime: &dyn AgentRuntime,
        outbox: Outbox,
        settings: &SessionSettings,
    ) -> Result<Self, SessionError> {
        let cwd = match request.cwd {
            Some(cwd) => PathBuf::from(cwd),
            None => std::env::current_dir().map_err(SessionError::Cwd)?,
        };

        let queue = InputQueue::new();
        if let Some(prompt) = request.prompt {
            queue
                .push(UserMessage::new(prompt))
                .map_err(SessionError::Send)?;
        }
        let input = queue.consume().map_err(SessionError::Send)?;

        let callbacks = Arc::new(CallbackRegistry::new(
            id.clone(),
            outbox,
            settings.callback_timeout,
        ));

        let conversation = runtime
            .start(StartRequest {
                input,
                cwd: cwd.clone(),
                options: request.options,
                callbacks: Arc::clone(&callbacks) as Arc<dyn runtime::RuntimeCallbacks>,
            })
            .await
            .map_err(|e| {
                callbacks.cancel_all();
                SessionError::Start(e)
            })?;

        info!(session_id = %id, cwd = %cwd.display(), "Session started");

        Ok(Self {
            id,
            cwd,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            queue,
            callbacks,
            control: conversation.control,
            conversation_id: Arc::new(OnceLock::new()),
            state: StateCell::new(),
            messages: Some(conversation.messages),
        })
    }

    /// Start draining runtime output into `sdk.message` envelopes.
    ///
    /// Callback requests held since start are released too, so the caller
    /// must have announced the session already. `on_exit` runs once the loop
    /// has stopped, for whatever reason.
    pub fn spawn_run_loop(&mut self, outbox: Outbox, on_exit: impl FnOnce() + Send + 'static) {
        let Some(messages) = self.messages.take() else {
            warn!(session_id = %self.id, "Run loop already started");
            return;
        };
        self.callbacks.open();
        self.state.set(SessionState::Running);

        let run = RunLoop {
            session_id: self.id.clone(),
            messages,
            cancel: self.cancel.clone(),
            outbox,
            conversation_id: Arc::clone(&self.conversation_id),
            state: self.state.clone(),
        };
        tokio::spawn(async move {
            run.run().await;
            on_exit();
        });
    }

    /// Push a user turn.
    pub fn send(&self, content: Value) -> Result<(), SessionError> {
        self.queue
            .push(UserMessage::new(content))
            .map_err(SessionError::Send)?;
        debug!(session_id = %self.id, "Queued user message");
        Ok(())
    }

    /// Interrupt the current turn.
    ///
    /// The returned future owns what it needs, so the caller can await it on
    /// another task.
    pub fn interrupt(&self) -> impl Future<Output = Result<(), SessionError>> + Send + use<> {
        let control = Arc::clone(&self.control);
        let state = self.state.clone();
        let session_id = self.id.clone();
        async move {
            state.set(SessionState::Interrupting);
            let result = control.interrupt().await;
            state.set(SessionState::Running);
            match result {
                Ok(()) => {
                    info!(%session_id, "Session interrupted");
                    Ok(())
                }
                Err(e) => {
                    warn!(%session_id, error = %e, "Interrupt failed");
                    Err(SessionError::Interrupt(e))
                }
            }
        }
    }

    /// Invoke an allow-listed control method on the runtime.
    pub fn query(
        &self,
        method: QueryMethod,
        args: Value,
    ) -> impl Future<Output = Result<Value, SessionError>> + Send + use<> {
        let control = Arc::clone(&self.control);
        async move {
            control
                .call(method, args)
                .await
                .map_err(|source| SessionError::Query { method, source })
        }
    }

    /// Settle a pending callback with the client's response.
    pub fn resolve_callback(&self, callback_id: &str, payload: &Value) -> bool {
        self.callbacks.resolve(callback_id, payload)
    }

    /// Tear the session down. Idempotent and safe while the run loop is mid-item.
    pub fn kill(&self) {
        let previous = self.state.set(SessionState::Killed);
        self.cancel.cancel();
        let cancelled = self.callbacks.cancel_all();
        self.queue.close();
        if !previous.is_terminal() {
            info!(session_id = %self.id, cancelled, "Session killed");
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// The runtime-assigned conversation id, once the runtime has reported one.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.get().map(String::as_str)
    }

    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.pending_count()
    }
}

/// Drains one conversation's output stream.
struct RunLoop {
    session_id: String,
    messages: BoxStream<'static, Result<Value, RuntimeError>>,
    cancel: CancellationToken,
    outbox: Outbox,
    conversation_id: Arc<OnceLock<String>>,
    state: StateCell,
}

impl RunLoop {
    async fn run(mut self) {
        let mut forwarded = 0_u64;
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!(session_id = %self.session_id, forwarded, "Run loop stopped by kill");
                    break;
                }
                next = self.messages.next() => next,
            };

            match next {
                Some(Ok(item)) => {
                    self.capture_conversation_id(&item);
                    forwarded += 1;
                    self.outbox.send(
                        Outbound::SdkMessage(item).into_envelope(None, Some(self.session_id.clone())),
                    );
                }
                Some(Err(e)) => {
                    if self.cancel.is_cancelled() {
                        debug!(session_id = %self.session_id, error = %e, "Runtime stream ended after kill");
                    } else {
                        warn!(session_id = %self.session_id, error = %e, "Runtime stream failed");
                        self.outbox.send(
                            Outbound::error(ErrorCode::RuntimeError, e.to_string())
                                .into_envelope(None, Some(self.session_id.clone())),
                        );
                    }
                    break;
                }
                None => {
                    info!(session_id = %self.session_id, forwarded, "Conversation completed");
                    break;
                }
            }
        }
        self.state.set(SessionState::Completed);
    }

    fn capture_conversation_id(&self, item: &Value) {
        if self.conversation_id.get().is_some() {
            return;
        }
        if let Some(id) = runtime::conversation_id(item)
            && self.conversation_id.set(id.to_string()).is_ok()
        {
            info!(session_id = %self.session_id, conversation_id = %id, "Captured runtime conversation id");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::runtime::PermissionContext;
    use crate::testing::ScriptedRuntime;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn started(
        runtime: &ScriptedRuntime,
        prompt: Option<Value>,
    ) -> (Session, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, rx) = Outbox::channel();
        let request = CreateSession {
            prompt,
            cwd: Some("/tmp".into()),
            options: serde_json::Map::new(),
        };
        let session = Session::start(
            "s1".into(),
            request,
            runtime,
            outbox,
            &SessionSettings::default(),
        )
        .await
        .unwrap();
        (session, rx)
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let state = StateCell::new();
        assert_eq!(state.set(SessionState::Running), SessionState::Starting);
        assert_eq!(state.set(SessionState::Killed), SessionState::Running);
        assert_eq!(state.set(SessionState::Running), SessionState::Killed);
        assert_eq!(state.get(), SessionState::Killed);
    }

    #[tokio::test]
    async fn test_prompt_is_first_input() {
        let runtime = ScriptedRuntime::new();
        let (session, _rx) = started(&runtime, Some(json!("first"))).await;
        let conversation = runtime.next_conversation().await.unwrap();

        session.send(json!("second")).unwrap();
        assert_eq!(conversation.next_input().await.unwrap(), UserMessage::text("first"));
        assert_eq!(conversation.next_input().await.unwrap(), UserMessage::text("second"));
        assert_eq!(session.state(), SessionState::Starting);
        assert_eq!(session.cwd, PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn test_run_loop_forwards_and_captures_conversation_id() {
        let runtime = ScriptedRuntime::new();
        let (mut session, _rx) = started(&runtime, None).await;
        let conversation = runtime.next_conversation().await.unwrap();

        let (outbox, mut out) = Outbox::channel();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        session.spawn_run_loop(outbox, move || {
            let _ = done_tx.send(());
        });
        assert_eq!(session.state(), SessionState::Running);

        conversation.emit(json!({"type": "system", "session_id": "conv-9"}));
        conversation.finish();

        let envelope = out.recv().await.unwrap();
        assert_eq!(envelope.kind, "sdk.message");
        assert_eq!(envelope.session_id.as_deref(), Some("s1"));
        assert_eq!(envelope.id, None);

        done_rx.await.unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.conversation_id(), Some("conv-9"));
    }

    #[tokio::test]
    async fn test_callbacks_wait_for_run_loop() {
        let runtime = ScriptedRuntime::new();
        let (mut session, mut rx) = started(&runtime, None).await;
        let conversation = runtime.next_conversation().await.unwrap();

        let pending = conversation.request_hook("SessionStart", json!({}), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.pending_callbacks(), 0);

        session.spawn_run_loop(Outbox::channel().0, || {});
        let request = rx.recv().await.unwrap();
        assert_eq!(request.kind, "callback.request");
        assert_eq!(request.id.as_deref(), Some("cb1"));

        assert!(session.resolve_callback("cb1", &json!({"continue": true})));
        assert_eq!(pending.await.unwrap().unwrap().continue_, Some(true));
        session.kill();
    }

    #[tokio::test]
    async fn test_kill_terminates_everything() {
        let runtime = ScriptedRuntime::new();
        let (mut session, _rx) = started(&runtime, None).await;
        let conversation = runtime.next_conversation().await.unwrap();
        session.spawn_run_loop(Outbox::channel().0, || {});

        let pending = conversation.request_permission("Bash", json!({}), PermissionContext::default());
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.pending_callbacks() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        session.kill();
        session.kill();
        assert_eq!(session.state(), SessionState::Killed);
        assert_eq!(
            pending.await.unwrap(),
            Err(runtime::CallbackError::SessionTerminated)
        );
        assert!(matches!(conversation.next_input().await, Err(crate::testing::TestError::Closed)));

        let err = session.send(json!("late")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SendMessageFailed);
        conversation.wait_closed().await.unwrap();
        assert_eq!(session.state(), SessionState::Killed);
    }
}
