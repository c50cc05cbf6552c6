//! Agent runtime backed by a CLI subprocess speaking stream-json on stdio.
//!
//! stdin carries user turns and control frames; stdout carries output items
//! and control frames. Control requests in both directions are correlated by
//! `request_id`:
//!
//! ```text
//! -> {"type":"control_request","request_id":"req_1","request":{"subtype":"interrupt"}}
//! <- {"type":"control_response","response":{"subtype":"success","request_id":"req_1","response":{}}}
//! ```

use super::{
    AgentRuntime, CallbackError, Conversation, ConversationControl, HookOutput,
    PermissionContext, PermissionDecision, QueryMethod, RuntimeCallbacks, RuntimeError,
    StartRequest, UserMessage,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Hook events registered with the runtime when none are configured.
pub const DEFAULT_HOOK_EVENTS: [&str; 7] = [
    "PreToolUse",
    "PostToolUse",
    "UserPromptSubmit",
    "Stop",
    "SubagentStop",
    "PreCompact",
    "Notification",
];

/// How long a control request may wait for the runtime's answer.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// How to launch the runtime process.
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Executable to spawn.
    pub command: PathBuf,
    /// Extra arguments appended after the protocol flags.
    pub args: Vec<String>,
    /// Lifecycle hook events forwarded to the client.
    pub hook_events: Vec<String>,
    pub control_timeout: Duration,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("claude"),
            args: Vec::new(),
            hook_events: DEFAULT_HOOK_EVENTS.iter().map(ToString::to_string).collect(),
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }
}

/// Spawns one runtime process per conversation.
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
}

impl ProcessRuntime {
    #[must_use]
    pub const fn new(config: ProcessRuntimeConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &StartRequest) -> Command {
        let mut command = Command::new(&self.config.command);
        command
            .args([
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--verbose",
                "--permission-prompt-tool",
                "stdio",
            ])
            .args(option_args(&request.options))
            .args(&self.config.args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Callback id → hook event name, in registration order.
    fn hook_ids(&self) -> Vec<(String, String)> {
        self.config
            .hook_events
            .iter()
            .enumerate()
            .map(|(i, event)| (format!("hook_{i}"), event.clone()))
            .collect()
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn start(&self, request: StartRequest) -> Result<Conversation, RuntimeError> {
        let mut child = self.command(&request).spawn().map_err(RuntimeError::Spawn)?;
        info!(
            command = %self.config.command.display(),
            cwd = %request.cwd.display(),
            pid = ?child.id(),
            "Spawned runtime process"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Protocol("runtime stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Protocol("runtime stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(stdin, line_rx));

        let control = Arc::new(ProcessControl::new(
            line_tx.clone(),
            self.config.control_timeout,
        ));
        let hook_ids = self.hook_ids();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        tokio::spawn(
            StdoutReader {
                child,
                control: Arc::clone(&control),
                callbacks: request.callbacks,
                hooks: hook_ids.iter().cloned().collect(),
                lines: line_tx.clone(),
                messages: message_tx,
            }
            .run(stdout),
        );

        let mut hooks = Map::new();
        for (callback_id, event) in &hook_ids {
            hooks.insert(
                event.clone(),
                json!([{ "matcher": null, "hookCallbackIds": [callback_id] }]),
            );
        }
        let init = control
            .request(json!({ "subtype": "initialize", "hooks": hooks }))
            .await?;
        debug!(?init, "Runtime initialized");
        let _ = control.init.set(init);

        tokio::spawn(pump_input(request.input, line_tx));

        Ok(Conversation {
            messages: UnboundedReceiverStream::new(message_rx).boxed(),
            control,
        })
    }
}

/// Command-line flags derived from the `session.create` options bag.
fn option_args(options: &Map<String, Value>) -> Vec<String> {
    let get = |camel: &str, snake: &str| options.get(camel).or_else(|| options.get(snake));
    let mut args = Vec::new();

    for (camel, snake, flag) in [
        ("model", "model", "--model"),
        ("permissionMode", "permission_mode", "--permission-mode"),
        ("resume", "resume", "--resume"),
        ("systemPrompt", "system_prompt", "--system-prompt"),
        (
            "appendSystemPrompt",
            "append_system_prompt",
            "--append-system-prompt",
        ),
    ] {
        if let Some(value) = get(camel, snake).and_then(Value::as_str) {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
    }

    if let Some(turns) = get("maxTurns", "max_turns").and_then(Value::as_u64) {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }

    for (camel, snake, flag) in [
        ("allowedTools", "allowed_tools", "--allowedTools"),
        ("disallowedTools", "disallowed_tools", "--disallowedTools"),
    ] {
        let tools = string_list(get(camel, snake));
        if !tools.is_empty() {
            args.push(flag.to_string());
            args.push(tools.join(","));
        }
    }

    for dir in string_list(get("additionalDirectories", "additional_directories")) {
        args.push("--add-dir".to_string());
        args.push(dir);
    }

    args
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

async fn write_lines(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(error = %e, "Runtime stdin write failed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "Runtime stdin flush failed");
            break;
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stderr = %line, "Runtime stderr");
    }
}

/// Feed user turns from the session queue to the runtime.
async fn pump_input(
    mut input: BoxStream<'static, UserMessage>,
    lines: mpsc::UnboundedSender<String>,
) {
    while let Some(message) = input.next().await {
        let frame = json!({
            "type": "user",
            "message": { "role": "user", "content": message.content },
            "parent_tool_use_id": null,
            "session_id": "default",
        });
        if lines.send(frame.to_string()).is_err() {
            break;
        }
    }
    debug!("Input stream ended");
}

type PendingControl = HashMap<String, oneshot::Sender<Result<Value, String>>>;

/// Outstanding control requests sent to the runtime.
struct ProcessControl {
    lines: mpsc::UnboundedSender<String>,
    pending: Mutex<PendingControl>,
    next_id: AtomicU64,
    timeout: Duration,
    /// Response to `initialize`: commands, models, account.
    init: OnceLock<Value>,
}

impl ProcessControl {
    fn new(lines: mpsc::UnboundedSender<String>, timeout: Duration) -> Self {
        Self {
            lines,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
            init: OnceLock::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingControl> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request(&self, request: Value) -> Result<Value, RuntimeError> {
        let id = format!("req_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);

        let frame = json!({ "type": "control_request", "request_id": id, "request": request });
        if self.lines.send(frame.to_string()).is_err() {
            self.pending().remove(&id);
            return Err(RuntimeError::Closed);
        }
        debug!(request_id = %id, %subtype, "Sent control request");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(message))) => Err(RuntimeError::ControlRejected(message)),
            Ok(Err(_)) => Err(RuntimeError::Closed),
            Err(_) => {
                self.pending().remove(&id);
                Err(RuntimeError::ControlTimeout(subtype))
            }
        }
    }

    fn complete(&self, request_id: &str, result: Result<Value, String>) {
        let tx = self.pending().remove(request_id);
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(%request_id, "Control response for unknown request"),
        }
    }

    /// Drop every pending request; their callers see the connection closed.
    fn fail_pending(&self) {
        self.pending().clear();
    }

    fn init_field(&self, key: &str) -> Value {
        self.init
            .get()
            .and_then(|init| init.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Extract a call argument given either positionally or by name.
fn argument<'a>(args: &'a Value, name: &str) -> Option<&'a Value> {
    match args {
        Value::Array(items) => items.first(),
        Value::Object(map) => map.get(name),
        Value::Null => None,
        scalar => Some(scalar),
    }
}

#[async_trait]
impl ConversationControl for ProcessControl {
    async fn interrupt(&self) -> Result<(), RuntimeError> {
        self.request(json!({ "subtype": "interrupt" })).await?;
        Ok(())
    }

    async fn call(&self, method: QueryMethod, args: Value) -> Result<Value, RuntimeError> {
        match method {
            QueryMethod::SetModel => {
                let model = argument(&args, "model").cloned().unwrap_or(Value::Null);
                self.request(json!({ "subtype": "set_model", "model": model }))
                    .await?;
                Ok(Value::Null)
            }
            QueryMethod::SetPermissionMode => {
                let mode = argument(&args, "mode")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RuntimeError::InvalidArguments {
                        method: method.as_str(),
                        message: "expected a permission mode string".into(),
                    })?;
                self.request(json!({ "subtype": "set_permission_mode", "mode": mode }))
                    .await?;
                Ok(Value::Null)
            }
            QueryMethod::SetMaxThinkingTokens => {
                let tokens = argument(&args, "tokens").cloned().unwrap_or(Value::Null);
                if !(tokens.is_null() || tokens.is_u64()) {
                    return Err(RuntimeError::InvalidArguments {
                        method: method.as_str(),
                        message: "expected a token count or null".into(),
                    });
                }
                self.request(json!({
                    "subtype": "set_max_thinking_tokens",
                    "max_thinking_tokens": tokens,
                }))
                .await?;
                Ok(Value::Null)
            }
            QueryMethod::McpServerStatus => {
                let response = self.request(json!({ "subtype": "mcp_status" })).await?;
                Ok(response.get("mcpServers").cloned().unwrap_or(response))
            }
            QueryMethod::SupportedCommands => Ok(self.init_field("commands")),
            QueryMethod::SupportedModels => Ok(self.init_field("models")),
            QueryMethod::AccountInfo => Ok(self.init_field("account")),
        }
    }
}

/// Demultiplexes the runtime's stdout into output items and control frames.
struct StdoutReader {
    child: Child,
    control: Arc<ProcessControl>,
    callbacks: Arc<dyn RuntimeCallbacks>,
    hooks: HashMap<String, String>,
    lines: mpsc::UnboundedSender<String>,
    messages: mpsc::UnboundedSender<Result<Value, RuntimeError>>,
}

impl StdoutReader {
    async fn run(mut self, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let mut abandoned = false;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                () = self.messages.closed() => {
                    debug!("Conversation dropped, stopping runtime process");
                    abandoned = true;
                    let _ = self.child.start_kill();
                    break;
                }
            };
            match line {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => break,
                Err(e) => {
                    let _ = self.messages.send(Err(RuntimeError::Io(e)));
                    break;
                }
            }
        }

        self.control.fail_pending();
        match self.child.wait().await {
            Ok(status) if status.success() || abandoned => {
                debug!(?status, "Runtime process exited");
            }
            Ok(status) => {
                warn!(?status, "Runtime process failed");
                let _ = self.messages.send(Err(RuntimeError::Exited(status.code())));
            }
            Err(e) => {
                let _ = self.messages.send(Err(RuntimeError::Io(e)));
            }
        }
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let frame: Value = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Skipping non-JSON runtime output");
                return;
            }
        };

        match frame.get("type").and_then(Value::as_str) {
            Some("control_response") => self.handle_control_response(&frame),
            Some("control_request") => self.handle_control_request(frame),
            Some("control_cancel_request") => {
                debug!(request_id = ?frame.get("request_id"), "Runtime cancelled a control request");
            }
            _ => {
                let _ = self.messages.send(Ok(frame));
            }
        }
    }

    fn handle_control_response(&self, frame: &Value) {
        let Some(response) = frame.get("response") else {
            warn!("control_response without response body");
            return;
        };
        let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
            warn!("control_response without request_id");
            return;
        };
        let result = if response.get("subtype").and_then(Value::as_str) == Some("error") {
            Err(response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("control request failed")
                .to_string())
        } else {
            Ok(response.get("response").cloned().unwrap_or_else(|| json!({})))
        };
        self.control.complete(request_id, result);
    }

    /// Answer a runtime-initiated request on its own task: the client may
    /// take minutes to respond.
    fn handle_control_request(&self, mut frame: Value) {
        let Some(request_id) = frame
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!("control_request without request_id");
            return;
        };
        let request = frame
            .get_mut("request")
            .map(Value::take)
            .unwrap_or_default();
        let callbacks = Arc::clone(&self.callbacks);
        let hook_event = request
            .get("callback_id")
            .and_then(Value::as_str)
            .and_then(|id| self.hooks.get(id))
            .cloned();
        let lines = self.lines.clone();

        tokio::spawn(async move {
            let result = answer_control_request(callbacks.as_ref(), request, hook_event).await;
            let response = match result {
                Ok(body) => json!({ "subtype": "success", "request_id": request_id, "response": body }),
                Err(error) => json!({ "subtype": "error", "request_id": request_id, "error": error }),
            };
            let frame = json!({ "type": "control_response", "response": response });
            let _ = lines.send(frame.to_string());
        });
    }
}

async fn answer_control_request(
    callbacks: &dyn RuntimeCallbacks,
    mut request: Value,
    hook_event: Option<String>,
) -> Result<Value, String> {
    let subtype = request
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let take = |request: &mut Value, key: &str| request.get_mut(key).map(Value::take);

    match subtype.as_str() {
        "can_use_tool" => {
            let tool_name = take(&mut request, "tool_name")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let input = take(&mut request, "input").unwrap_or_else(|| json!({}));
            let context = PermissionContext {
                suggestions: take(&mut request, "permission_suggestions")
                    .and_then(|v| v.as_array().cloned()),
                blocked_path: take(&mut request, "blocked_path")
                    .and_then(|v| v.as_str().map(str::to_string)),
                decision_reason: take(&mut request, "decision_reason")
                    .and_then(|v| v.as_str().map(str::to_string)),
                tool_use_id: take(&mut request, "tool_use_id")
                    .and_then(|v| v.as_str().map(str::to_string)),
                agent_id: take(&mut request, "agent_id")
                    .and_then(|v| v.as_str().map(str::to_string)),
            };
            let decision = callbacks
                .can_use_tool(tool_name, input.clone(), context)
                .await
                .map_err(|e: CallbackError| e.to_string())?;
            Ok(permission_response(decision, input))
        }
        "hook_callback" => {
            let event = hook_event.ok_or_else(|| "unknown hook callback id".to_string())?;
            let input = take(&mut request, "input").unwrap_or_else(|| json!({}));
            let tool_use_id = take(&mut request, "tool_use_id")
                .and_then(|v| v.as_str().map(str::to_string));
            let output: HookOutput = callbacks
                .hook(event, input, tool_use_id)
                .await
                .map_err(|e| e.to_string())?;
            serde_json::to_value(output).map_err(|e| e.to_string())
        }
        other => Err(format!("unsupported control request: {other}")),
    }
}

/// The runtime requires `updatedInput` on allow; echo the original input
/// when the client did not send one.
fn permission_response(decision: PermissionDecision, original_input: Value) -> Value {
    match decision {
        PermissionDecision::Allow {
            updated_input,
            updated_permissions,
        } => {
            let mut body = json!({
                "behavior": "allow",
                "updatedInput": updated_input.unwrap_or(original_input),
            });
            if let Some(permissions) = updated_permissions {
                body["updatedPermissions"] = Value::Array(permissions);
            }
            body
        }
        deny @ PermissionDecision::Deny { .. } => {
            serde_json::to_value(deny).unwrap_or_else(|_| json!({ "behavior": "deny" }))
        }
    }
}
