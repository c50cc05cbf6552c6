//! Fuzz target for envelope parsing.
//!
//! Arbitrary bytes must never panic the line decoder.

#![no_main]

use agent_bridge::protocol::{Command, Envelope};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Lines arrive as UTF-8 text from the client
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(envelope) = Envelope::parse(line) {
            let _ = Command::from_envelope(&envelope);
            // Anything we accepted must serialize back to one line
            assert!(!envelope.to_line().contains('\n'));
        }
    }
});
