//! Correlation of runtime callbacks with client responses.
//!
//! Each permission check or hook invocation raised by the runtime is sent to
//! the client as a `callback.request` and parked here under a fresh id until
//! the matching `callback.response` arrives. Whichever of resolve, timeout or
//! `cancel_all` removes the entry first decides the outcome.
//!
//! Requests raised before the session has been announced to the client are
//! held until `open` is called, so a client never sees a callback for a
//! session it does not know yet.

use super::Outbox;
use crate::protocol::{CallbackRequest, Outbound};
use crate::runtime::{
    CallbackError, HookOutput, PermissionContext, PermissionDecision, RuntimeCallbacks,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a callback may stay unanswered before its fallback applies.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Deny message used when a permission check times out.
pub const PERMISSION_TIMEOUT_MESSAGE: &str = "Permission request timed out";

const DEFAULT_DENY_MESSAGE: &str = "Denied";

type Reply<T> = oneshot::Sender<Result<T, CallbackError>>;

/// A parked callback, with what is needed to translate its response.
enum Pending {
    Permission {
        reply: Reply<PermissionDecision>,
        tool_input: Value,
        has_suggestions: bool,
    },
    Hook {
        reply: Reply<HookOutput>,
        event: String,
    },
}

#[derive(Default)]
struct RegistryState {
    pending: HashMap<String, Pending>,
    terminated: bool,
}

/// Per-session table of outstanding callbacks.
pub struct CallbackRegistry {
    session_id: String,
    outbox: Outbox,
    timeout: Duration,
    next_id: AtomicU64,
    opened: CancellationToken,
    state: Mutex<RegistryState>,
}

impl CallbackRegistry {
    #[must_use]
    pub fn new(session_id: impl Into<String>, outbox: Outbox, timeout: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            outbox,
            timeout,
            next_id: AtomicU64::new(1),
            opened: CancellationToken::new(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release held requests and send later ones straight away.
    pub fn open(&self) {
        self.opened.cancel();
    }

    fn next_callback_id(&self) -> String {
        format!("cb{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of callbacks still waiting for an answer.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Ask the client whether a tool may run. Times out fail-closed.
    pub async fn request_permission(
        &self,
        tool_name: String,
        tool_input: Value,
        context: PermissionContext,
    ) -> Result<PermissionDecision, CallbackError> {
        let (reply, rx) = oneshot::channel();
        let pending = Pending::Permission {
            reply,
            tool_input: tool_input.clone(),
            has_suggestions: context.has_suggestions(),
        };
        let request = CallbackRequest::CanUseTool {
            tool_name,
            tool_input,
            context,
        };
        self.park(pending, request, rx, || {
            PermissionDecision::deny(PERMISSION_TIMEOUT_MESSAGE)
        })
        .await
    }

    /// Ask the client to run a lifecycle hook. Times out fail-open.
    pub async fn request_hook(
        &self,
        event: String,
        input: Value,
        tool_use_id: Option<String>,
    ) -> Result<HookOutput, CallbackError> {
        let (reply, rx) = oneshot::channel();
        let pending = Pending::Hook {
            reply,
            event: event.clone(),
        };
        let request = CallbackRequest::Hook {
            hook_event: event,
            hook_input: input,
            tool_use_id,
        };
        self.park(pending, request, rx, HookOutput::default).await
    }

    async fn park<T>(
        &self,
        pending: Pending,
        request: CallbackRequest,
        mut rx: oneshot::Receiver<Result<T, CallbackError>>,
        on_timeout: impl FnOnce() -> T + Send,
    ) -> Result<T, CallbackError> {
        self.opened.cancelled().await;
        let id = self.next_callback_id();
        {
            let mut state = self.state();
            if state.terminated {
                return Err(CallbackError::SessionTerminated);
            }
            state.pending.insert(id.clone(), pending);
        }
        let _guard = PendingGuard {
            registry: self,
            id: &id,
        };

        debug!(session_id = %self.session_id, callback_id = %id, "Callback requested");
        self.outbox.send(
            Outbound::CallbackRequest(request)
                .into_envelope(Some(id.clone()), Some(self.session_id.clone())),
        );

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(result) => result.unwrap_or(Err(CallbackError::SessionTerminated)),
            Err(_elapsed) => {
                if self.take(&id).is_some() {
                    info!(session_id = %self.session_id, callback_id = %id, "Callback timed out, applying fallback");
                    Ok(on_timeout())
                } else {
                    // Resolved or cancelled concurrently; its answer is on the way.
                    rx.await.unwrap_or(Err(CallbackError::SessionTerminated))
                }
            }
        }
    }

    fn take(&self, id: &str) -> Option<Pending> {
        self.state().pending.remove(id)
    }

    /// Settle a pending callback with the client's raw response.
    ///
    /// Unknown or already-settled ids are logged and ignored. Returns whether
    /// a pending callback was settled.
    pub fn resolve(&self, id: &str, raw: &Value) -> bool {
        let Some(pending) = self.take(id) else {
            warn!(session_id = %self.session_id, callback_id = %id, "Response for unknown or expired callback ignored");
            return false;
        };

        match pending {
            Pending::Permission {
                reply,
                tool_input,
                has_suggestions,
            } => {
                let decision = self.translate_permission(id, raw, &tool_input, has_suggestions);
                debug!(session_id = %self.session_id, callback_id = %id, allow = decision.is_allow(), "Permission resolved");
                let _ = reply.send(Ok(decision));
            }
            Pending::Hook { reply, event } => {
                debug!(session_id = %self.session_id, callback_id = %id, %event, "Hook resolved");
                let _ = reply.send(Ok(translate_hook(raw)));
            }
        }
        true
    }

    fn translate_permission(
        &self,
        id: &str,
        raw: &Value,
        tool_input: &Value,
        has_suggestions: bool,
    ) -> PermissionDecision {
        if raw.get("behavior").and_then(Value::as_str) != Some("allow") {
            return PermissionDecision::Deny {
                message: raw
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_DENY_MESSAGE)
                    .to_string(),
                interrupt: raw.get("interrupt").and_then(Value::as_bool),
            };
        }

        let updated_input = field(raw, "updatedInput", "updated_input").cloned();
        let updated_permissions = field(raw, "updatedPermissions", "updated_permissions")
            .and_then(Value::as_array)
            .cloned();

        match &updated_input {
            None => {
                warn!(session_id = %self.session_id, callback_id = %id, "Allow response without updated_input");
            }
            Some(input) if is_empty(input) && !is_empty(tool_input) => {
                warn!(session_id = %self.session_id, callback_id = %id, "Allow response has empty updated_input for non-empty tool input");
            }
            Some(_) => {}
        }
        if updated_permissions.is_none() && has_suggestions {
            warn!(session_id = %self.session_id, callback_id = %id, "Allow response dropped the suggested permission updates");
        }

        PermissionDecision::Allow {
            updated_input,
            updated_permissions,
        }
    }

    /// Fail every pending callback with "session terminated" and refuse new
    /// ones. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut state = self.state();
            state.terminated = true;
            self.opened.cancel();
            state.pending.drain().map(|(_, pending)| pending).collect()
        };

        let count = drained.len();
        for pending in drained {
            match pending {
                Pending::Permission { reply, .. } => {
                    let _ = reply.send(Err(CallbackError::SessionTerminated));
                }
                Pending::Hook { reply, .. } => {
                    let _ = reply.send(Err(CallbackError::SessionTerminated));
                }
            }
        }
        if count > 0 {
            info!(session_id = %self.session_id, count, "Cancelled pending callbacks");
        }
        count
    }
}

#[async_trait]
impl RuntimeCallbacks for CallbackRegistry {
    async fn can_use_tool(
        &self,
        tool_name: String,
        tool_input: Value,
        context: PermissionContext,
    ) -> Result<PermissionDecision, CallbackError> {
        self.request_permission(tool_name, tool_input, context)
            .await
    }

    async fn hook(
        &self,
        event: String,
        input: Value,
        tool_use_id: Option<String>,
    ) -> Result<HookOutput, CallbackError> {
        self.request_hook(event, input, tool_use_id).await
    }
}

/// Drops the registry entry if the waiting request is abandoned.
struct PendingGuard<'a> {
    registry: &'a CallbackRegistry,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.registry.take(self.id).is_some() {
            debug!(session_id = %self.registry.session_id, callback_id = %self.id, "Abandoned callback removed");
        }
    }
}

/// A response field, accepting its deprecated spelling as a fallback.
fn field<'a>(raw: &'a Value, preferred: &str, deprecated: &str) -> Option<&'a Value> {
    raw.get(preferred)
        .filter(|v| !v.is_null())
        .or_else(|| raw.get(deprecated).filter(|v| !v.is_null()))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn translate_hook(raw: &Value) -> HookOutput {
    let string = |preferred, deprecated| {
        field(raw, preferred, deprecated)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    HookOutput {
        continue_: field(raw, "continue", "continue_").and_then(Value::as_bool),
        suppress_output: field(raw, "suppressOutput", "suppress_output").and_then(Value::as_bool),
        stop_reason: string("stopReason", "stop_reason"),
        decision: field(raw, "decision", "decision").cloned(),
        system_message: string("systemMessage", "system_message"),
        reason: string("reason", "reason"),
        hook_specific_output: field(raw, "hookSpecificOutput", "hook_specific_output").cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn registry(timeout: Duration) -> (Arc<CallbackRegistry>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, rx) = Outbox::channel();
        let registry = Arc::new(CallbackRegistry::new("s1", outbox, timeout));
        registry.open();
        (registry, rx)
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        let envelope = rx.recv().await.expect("callback.request envelope");
        assert_eq!(envelope.kind, "callback.request");
        assert_eq!(envelope.session_id.as_deref(), Some("s1"));
        envelope
    }

    #[tokio::test]
    async fn test_permission_round_trip_uses_envelope_id() {
        let (reg, mut rx) = registry(DEFAULT_CALLBACK_TIMEOUT);
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_permission(
                    "Bash".into(),
                    json!({"command": "ls"}),
                    PermissionContext::default(),
                )
                .await
            })
        };

        let envelope = next_request(&mut rx).await;
        assert_eq!(envelope.id.as_deref(), Some("cb1"));
        assert_eq!(envelope.payload["callback_type"], "can_use_tool");
        assert_eq!(envelope.payload["tool_name"], "Bash");
        assert_eq!(envelope.payload["tool_input"], json!({"command": "ls"}));

        assert!(reg.resolve(
            "cb1",
            &json!({"behavior": "allow", "updated_input": {"command": "ls"}})
        ));
        let decision = task.await.unwrap().unwrap();
        assert_eq!(
            decision,
            PermissionDecision::Allow {
                updated_input: Some(json!({"command": "ls"})),
                updated_permissions: None,
            }
        );
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_resolve_is_noop() {
        let (reg, mut rx) = registry(DEFAULT_CALLBACK_TIMEOUT);
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_permission("Read".into(), json!({}), PermissionContext::default())
                    .await
            })
        };
        let id = next_request(&mut rx).await.id.unwrap();

        assert!(reg.resolve(&id, &json!({"behavior": "deny", "message": "no"})));
        assert!(!reg.resolve(&id, &json!({"behavior": "allow"})));
        assert_eq!(
            task.await.unwrap().unwrap(),
            PermissionDecision::deny("no")
        );
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let (reg, _rx) = registry(DEFAULT_CALLBACK_TIMEOUT);
        assert!(!reg.resolve("cb404", &json!({"behavior": "allow"})));
    }

    #[tokio::test]
    async fn test_deny_defaults() {
        let (reg, mut rx) = registry(DEFAULT_CALLBACK_TIMEOUT);
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_permission("Write".into(), json!({"path": "x"}), PermissionContext::default())
                    .await
            })
        };
        let id = next_request(&mut rx).await.id.unwrap();
        reg.resolve(&id, &json!({"interrupt": true}));
        assert_eq!(
            task.await.unwrap().unwrap(),
            PermissionDecision::Deny {
                message: "Denied".into(),
                interrupt: Some(true),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_timeout_fails_closed() {
        let (reg, mut rx) = registry(Duration::from_secs(5));
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_permission("Bash".into(), json!({}), PermissionContext::default())
                    .await
            })
        };
        let id = next_request(&mut rx).await.id.unwrap();

        let decision = task.await.unwrap().unwrap();
        assert_eq!(decision, PermissionDecision::deny(PERMISSION_TIMEOUT_MESSAGE));
        assert_eq!(reg.pending_count(), 0);
        assert!(!reg.resolve(&id, &json!({"behavior": "allow"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_timeout_fails_open() {
        let (reg, mut rx) = registry(Duration::from_secs(5));
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_hook("PreToolUse".into(), json!({"tool_name": "Bash"}), Some("tu1".into()))
                    .await
            })
        };
        let envelope = next_request(&mut rx).await;
        assert_eq!(envelope.payload["callback_type"], "hook");
        assert_eq!(envelope.payload["hook_event"], "PreToolUse");
        assert_eq!(envelope.payload["tool_use_id"], "tu1");

        let output = task.await.unwrap().unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_hook_prefers_current_field_names() {
        let (reg, mut rx) = registry(DEFAULT_CALLBACK_TIMEOUT);
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.request_hook("Stop".into(), json!({}), None).await })
        };
        let id = next_request(&mut rx).await.id.unwrap();
        reg.resolve(
            &id,
            &json!({
                "continue": false,
                "continue_": true,
                "stop_reason": "old",
                "stopReason": "new",
                "suppress_output": true,
                "decision": "block",
                "hook_specific_output": {"hookEventName": "Stop"},
            }),
        );

        let output = task.await.unwrap().unwrap();
        assert_eq!(output.continue_, Some(false));
        assert_eq!(output.stop_reason.as_deref(), Some("new"));
        assert_eq!(output.suppress_output, Some(true));
        assert_eq!(output.decision, Some(json!("block")));
        assert_eq!(output.hook_specific_output, Some(json!({"hookEventName": "Stop"})));
        assert_eq!(output.system_message, None);
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_pending_and_later_requests() {
        let (reg, mut rx) = registry(DEFAULT_CALLBACK_TIMEOUT);
        let permission = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_permission("Bash".into(), json!({}), PermissionContext::default())
                    .await
            })
        };
        let hook = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.request_hook("Stop".into(), json!({}), None).await })
        };
        next_request(&mut rx).await;
        next_request(&mut rx).await;

        assert_eq!(reg.cancel_all(), 2);
        assert_eq!(
            permission.await.unwrap(),
            Err(CallbackError::SessionTerminated)
        );
        assert_eq!(hook.await.unwrap(), Err(CallbackError::SessionTerminated));

        let late = reg.request_hook("Stop".into(), json!({}), None).await;
        assert_eq!(late, Err(CallbackError::SessionTerminated));
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_removed() {
        let (reg, mut rx) = registry(DEFAULT_CALLBACK_TIMEOUT);
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_permission("Bash".into(), json!({}), PermissionContext::default())
                    .await
            })
        };
        next_request(&mut rx).await;
        assert_eq!(reg.pending_count(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_requests_held_until_open() {
        let (outbox, mut rx) = Outbox::channel();
        let reg = Arc::new(CallbackRegistry::new("s1", outbox, DEFAULT_CALLBACK_TIMEOUT));
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.request_permission("Bash".into(), json!({}), PermissionContext::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(reg.pending_count(), 0);

        reg.open();
        let envelope = next_request(&mut rx).await;
        assert_eq!(envelope.id.as_deref(), Some("cb1"));
        assert!(reg.resolve("cb1", &json!({"behavior": "allow", "updatedInput": {}})));
        assert!(task.await.unwrap().unwrap().is_allow());
    }

    #[tokio::test]
    async fn test_cancel_all_releases_held_requests() {
        let (outbox, mut rx) = Outbox::channel();
        let reg = Arc::new(CallbackRegistry::new("s1", outbox, DEFAULT_CALLBACK_TIMEOUT));
        let task = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.request_hook("Stop".into(), json!({}), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        reg.cancel_all();
        assert_eq!(task.await.unwrap(), Err(CallbackError::SessionTerminated));
        assert!(rx.try_recv().is_err());
    }
}
