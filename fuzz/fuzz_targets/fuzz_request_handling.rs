//! Fuzz target for envelope dispatch.
//!
//! Builds structured envelopes with arbitrary field values and feeds them
//! through the decoder, including every known type with mangled payloads.

#![no_main]

use agent_bridge::protocol::{Command, Envelope};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use serde_json::{Value, json};

const KINDS: [&str; 7] = [
    "session.create",
    "session.send",
    "session.interrupt",
    "session.kill",
    "callback.response",
    "query.call",
    "session.unknown",
];

#[derive(Debug, Arbitrary)]
enum FuzzPayload {
    Empty,
    Prompt(String),
    Message { text: String, blocks: bool },
    Query { method: String, args: Vec<String> },
    Callback { behavior: String, message: Option<String> },
    Raw(String),
}

#[derive(Debug, Arbitrary)]
struct FuzzEnvelope {
    kind: u8,
    id: Option<String>,
    session_id: Option<String>,
    payload: FuzzPayload,
}

fuzz_target!(|input: FuzzEnvelope| {
    let payload = match input.payload {
        FuzzPayload::Empty => json!({}),
        FuzzPayload::Prompt(prompt) => json!({ "prompt": prompt, "cwd": "/tmp" }),
        FuzzPayload::Message { text, blocks } => {
            if blocks {
                json!({ "message": [{ "type": "text", "text": text }] })
            } else {
                json!({ "content": text })
            }
        }
        FuzzPayload::Query { method, args } => json!({ "method": method, "args": args }),
        FuzzPayload::Callback { behavior, message } => {
            json!({ "behavior": behavior, "message": message })
        }
        FuzzPayload::Raw(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
    };

    let envelope = Envelope {
        kind: KINDS[usize::from(input.kind) % KINDS.len()].to_string(),
        id: input.id,
        session_id: input.session_id,
        payload,
    };

    // Roundtrip through the wire format - should not panic
    let line = envelope.to_line();
    if let Ok(parsed) = Envelope::parse(&line) {
        let _ = Command::from_envelope(&parsed);
    }
});
