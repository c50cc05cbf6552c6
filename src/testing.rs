//! Test framework for bridge scenarios.
//!
//! Runs a [`Server`] over in-memory pipes against a [`ScriptedRuntime`] whose
//! conversations are driven by the test:
//!
//! ```ignore
//! let mut harness = TestHarness::new();
//! let (session_id, conversation) = harness.create_session("hello").await?;
//!
//! conversation.emit(json!({"type": "assistant", "session_id": "c1"}));
//! let message = harness.recv().await?;
//! assert_eq!(message["type"], "sdk.message");
//! ```

use crate::runtime::{
    AgentRuntime, CallbackError, Conversation, ConversationControl, HookOutput,
    PermissionContext, PermissionDecision, QueryMethod, RuntimeCallbacks, RuntimeError,
    StartRequest, UserMessage,
};
use crate::server::{Server, ServerError, ServerOptions};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// How long harness helpers wait before giving up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

static REQUEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("stream closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("undecodable output line: {0}")]
    Decode(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected envelope: {0}")]
    Unexpected(Value),
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An [`AgentRuntime`] whose conversations are puppeted by test code.
pub struct ScriptedRuntime {
    started_tx: mpsc::UnboundedSender<ScriptedConversation>,
    started_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedConversation>>,
    fail_next: Mutex<Option<String>>,
    starts: AtomicUsize,
}

impl ScriptedRuntime {
    #[must_use]
    pub fn new() -> Self {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        Self {
            started_tx,
            started_rx: tokio::sync::Mutex::new(started_rx),
            fail_next: Mutex::new(None),
            starts: AtomicUsize::new(0),
        }
    }

    /// Make the next `start` fail with `message`.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        *lock(&self.fail_next) = Some(message.into());
    }

    /// Number of conversations started so far.
    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Wait for the next conversation to be started.
    pub async fn next_conversation(&self) -> Result<ScriptedConversation, TestError> {
        let mut rx = self.started_rx.lock().await;
        tokio::time::timeout(DEFAULT_WAIT, rx.recv())
            .await
            .map_err(|_| TestError::Timeout)?
            .ok_or(TestError::Closed)
    }
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn start(&self, request: StartRequest) -> Result<Conversation, RuntimeError> {
        if let Some(message) = lock(&self.fail_next).take() {
            return Err(RuntimeError::Protocol(message));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(ScriptedControl::default());
        let conversation = ScriptedConversation {
            cwd: request.cwd,
            options: request.options,
            input: Arc::new(tokio::sync::Mutex::new(request.input)),
            callbacks: request.callbacks,
            messages: Arc::new(Mutex::new(Some(tx))),
            control: Arc::clone(&control),
        };
        let _ = self.started_tx.send(conversation);

        Ok(Conversation {
            messages: UnboundedReceiverStream::new(rx).boxed(),
            control,
        })
    }
}

/// Test-side handle on one scripted conversation.
#[derive(Clone)]
pub struct ScriptedConversation {
    pub cwd: PathBuf,
    pub options: Map<String, Value>,
    input: Arc<tokio::sync::Mutex<BoxStream<'static, UserMessage>>>,
    callbacks: Arc<dyn RuntimeCallbacks>,
    messages: Arc<Mutex<Option<mpsc::UnboundedSender<Result<Value, RuntimeError>>>>>,
    control: Arc<ScriptedControl>,
}

impl ScriptedConversation {
    /// Emit an output item.
    pub fn emit(&self, item: Value) {
        if let Some(tx) = lock(&self.messages).as_ref() {
            let _ = tx.send(Ok(item));
        }
    }

    /// End the output stream with an error.
    pub fn fail(&self, message: impl Into<String>) {
        if let Some(tx) = lock(&self.messages).take() {
            let _ = tx.send(Err(RuntimeError::Protocol(message.into())));
        }
    }

    /// End the output stream normally.
    pub fn finish(&self) {
        lock(&self.messages).take();
    }

    /// True once the bridge has stopped consuming output.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.messages)
            .as_ref()
            .is_none_or(mpsc::UnboundedSender::is_closed)
    }

    /// Wait until the bridge stops consuming output.
    pub async fn wait_closed(&self) -> Result<(), TestError> {
        let tx = lock(&self.messages).clone();
        let Some(tx) = tx else {
            return Ok(());
        };
        tokio::time::timeout(DEFAULT_WAIT, tx.closed())
            .await
            .map_err(|_| TestError::Timeout)
    }

    /// Pull the next user message from the input stream.
    pub async fn next_input(&self) -> Result<UserMessage, TestError> {
        let mut input = self.input.lock().await;
        tokio::time::timeout(DEFAULT_WAIT, input.next())
            .await
            .map_err(|_| TestError::Timeout)?
            .ok_or(TestError::Closed)
    }

    /// Ask for tool permission in the background.
    pub fn request_permission(
        &self,
        tool_name: &str,
        tool_input: Value,
        context: PermissionContext,
    ) -> JoinHandle<Result<PermissionDecision, CallbackError>> {
        let callbacks = Arc::clone(&self.callbacks);
        let tool_name = tool_name.to_string();
        tokio::spawn(async move { callbacks.can_use_tool(tool_name, tool_input, context).await })
    }

    /// Run a lifecycle hook in the background.
    pub fn request_hook(
        &self,
        event: &str,
        input: Value,
        tool_use_id: Option<&str>,
    ) -> JoinHandle<Result<HookOutput, CallbackError>> {
        let callbacks = Arc::clone(&self.callbacks);
        let event = event.to_string();
        let tool_use_id = tool_use_id.map(str::to_string);
        tokio::spawn(async move { callbacks.hook(event, input, tool_use_id).await })
    }

    /// Number of interrupts the bridge delivered.
    #[must_use]
    pub fn interrupts(&self) -> usize {
        self.control.interrupts.load(Ordering::SeqCst)
    }

    /// Make every later interrupt fail with `message`.
    pub fn fail_interrupts(&self, message: impl Into<String>) {
        *lock(&self.control.interrupt_error) = Some(message.into());
    }

    /// Canned result for a query method.
    pub fn set_query_result(&self, method: QueryMethod, result: Value) {
        lock(&self.control.results).insert(method, result);
    }

    /// Every query call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(QueryMethod, Value)> {
        lock(&self.control.calls).clone()
    }
}

#[derive(Default)]
struct ScriptedControl {
    interrupts: AtomicUsize,
    interrupt_error: Mutex<Option<String>>,
    results: Mutex<HashMap<QueryMethod, Value>>,
    calls: Mutex<Vec<(QueryMethod, Value)>>,
}

#[async_trait]
impl ConversationControl for ScriptedControl {
    async fn interrupt(&self) -> Result<(), RuntimeError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        match lock(&self.interrupt_error).clone() {
            Some(message) => Err(RuntimeError::ControlRejected(message)),
            None => Ok(()),
        }
    }

    async fn call(&self, method: QueryMethod, args: Value) -> Result<Value, RuntimeError> {
        lock(&self.calls).push((method, args));
        Ok(lock(&self.results).get(&method).cloned().unwrap_or(Value::Null))
    }
}

/// A bridge server wired to in-memory pipes.
pub struct TestHarness {
    runtime: Arc<ScriptedRuntime>,
    server: Arc<Server>,
    input: Option<DuplexStream>,
    output: Lines<BufReader<DuplexStream>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestHarness {
    /// Start a harness with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    /// Start a harness with custom server options.
    #[must_use]
    pub fn with_options(options: ServerOptions) -> Self {
        let runtime = Arc::new(ScriptedRuntime::new());
        let server = Arc::new(Server::new(
            Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
            options,
        ));

        let (client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);

        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run(server_in, server_out).await })
        };

        Self {
            runtime,
            server,
            input: Some(client_in),
            output: BufReader::new(client_out).lines(),
            task,
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &ScriptedRuntime {
        &self.runtime
    }

    /// A fresh request id.
    #[must_use]
    pub fn next_request_id() -> String {
        format!("req-{}", REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Write one raw line to the bridge.
    pub async fn send_raw(&mut self, line: &str) -> Result<(), TestError> {
        let input = self.input.as_mut().ok_or(TestError::Closed)?;
        input.write_all(line.as_bytes()).await?;
        input.write_all(b"\n").await?;
        input.flush().await?;
        Ok(())
    }

    /// Write one envelope to the bridge.
    pub async fn send(&mut self, envelope: Value) -> Result<(), TestError> {
        self.send_raw(&envelope.to_string()).await
    }

    /// Read the next envelope from the bridge.
    pub async fn recv(&mut self) -> Result<Value, TestError> {
        let line = tokio::time::timeout(DEFAULT_WAIT, self.output.next_line())
            .await
            .map_err(|_| TestError::Timeout)??
            .ok_or(TestError::Closed)?;
        serde_json::from_str(&line).map_err(|_| TestError::Decode(line))
    }

    /// Read envelopes until one matches, discarding the rest.
    pub async fn recv_matching(
        &mut self,
        predicate: impl Fn(&Value) -> bool,
    ) -> Result<Value, TestError> {
        loop {
            let envelope = self.recv().await?;
            if predicate(&envelope) {
                return Ok(envelope);
            }
        }
    }

    /// Assert nothing arrives for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) -> Result<(), TestError> {
        match tokio::time::timeout(quiet, self.output.next_line()).await {
            Err(_) => Ok(()),
            Ok(Ok(Some(line))) => Err(TestError::Unexpected(
                serde_json::from_str(&line).unwrap_or(Value::String(line)),
            )),
            Ok(Ok(None)) => Err(TestError::Closed),
            Ok(Err(e)) => Err(TestError::Io(e)),
        }
    }

    /// Create a session and return its id with the scripted conversation.
    pub async fn create_session(
        &mut self,
        prompt: &str,
    ) -> Result<(String, ScriptedConversation), TestError> {
        self.create_session_with(json!({ "prompt": prompt })).await
    }

    /// Create a session with an explicit payload.
    pub async fn create_session_with(
        &mut self,
        payload: Value,
    ) -> Result<(String, ScriptedConversation), TestError> {
        let request_id = Self::next_request_id();
        self.send(json!({ "type": "session.create", "id": request_id, "payload": payload }))
            .await?;
        let created = self.recv().await?;
        if created["type"] != "session.created" || created["id"] != request_id.as_str() {
            return Err(TestError::Unexpected(created));
        }
        let session_id = created["session_id"]
            .as_str()
            .ok_or_else(|| TestError::Unexpected(created.clone()))?
            .to_string();
        let conversation = self.runtime.next_conversation().await?;
        Ok((session_id, conversation))
    }

    /// Request server shutdown and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), TestError> {
        self.server.shutdown();
        self.join().await
    }

    /// Close the client's input and wait for the server to finish.
    pub async fn close(mut self) -> Result<(), TestError> {
        self.input.take();
        self.join().await
    }

    async fn join(self) -> Result<(), TestError> {
        tokio::time::timeout(DEFAULT_WAIT, self.task)
            .await
            .map_err(|_| TestError::Timeout)?
            .map_err(|e| TestError::Server(e.to_string()))?
            .map_err(|e| TestError::Server(e.to_string()))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
