//! Session table.

use super::session::Session;
use std::collections::HashMap;

/// Owns every live session, keyed by id.
///
/// Ids carry a per-process sequence number, so an id is never handed out twice
/// even after its session is gone.
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    next_seq: u64,
}

impl SessionManager {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Generate a fresh session id.
    pub fn allocate_id(&mut self) -> String {
        let base_name = names::Generator::default()
            .next()
            .unwrap_or_else(|| "session".to_string());
        self.next_seq += 1;
        format!("{base_name}-{}", self.next_seq)
    }

    /// Register a started session under its allocated id.
    pub fn add(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Get a session by id.
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Remove a session. Its id is not matched again.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Remove every session.
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    /// List all live sessions.
    pub fn list(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Get the number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
