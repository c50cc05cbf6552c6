//! JSON Lines log of wire traffic.

// Timestamp won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// Errors opening or flushing the traffic log.
#[derive(Debug, Error)]
pub enum TrafficLogError {
    #[error("failed to open traffic log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to flush traffic log: {0}")]
    Flush(#[source] std::io::Error),
}

/// Which way a line travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to bridge.
    In,
    /// Bridge to client.
    Out,
}

/// One logged line. JSON lines are embedded as JSON, anything else as text.
#[derive(Debug, Serialize)]
struct TrafficEntry<'a> {
    /// Unix timestamp in milliseconds.
    timestamp: u64,
    direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

/// Append-only traffic log.
pub struct TrafficLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl TrafficLog {
    /// Open (or create) the log file for appending.
    pub fn open(path: &Path) -> Result<Self, TrafficLogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| TrafficLogError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| TrafficLogError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Get the current Unix timestamp in milliseconds.
    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Record one line. Write failures are logged, never propagated.
    pub fn record(&self, direction: Direction, line: &str) {
        let json = serde_json::from_str::<Value>(line).ok();
        let entry = TrafficEntry {
            timestamp: Self::now_millis(),
            direction,
            text: json.is_none().then_some(line),
            json,
        };
        let Ok(mut encoded) = serde_json::to_string(&entry) else {
            return;
        };
        encoded.push('\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(encoded.as_bytes()) {
            warn!(path = %self.path.display(), error = %e, "Traffic log write failed");
        }
    }

    /// Flush buffered entries to disk.
    pub fn flush(&self) -> Result<(), TrafficLogError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .map_err(TrafficLogError::Flush)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "agent-bridge-traffic-{}-{name}.jsonl",
            std::process::id()
        ))
    }

    #[test]
    fn test_records_json_and_text_lines() {
        let path = temp_log_path("records");
        std::fs::remove_file(&path).ok();

        let log = TrafficLog::open(&path).unwrap();
        log.record(Direction::In, r#"{"type":"session.create","payload":{}}"#);
        log.record(Direction::Out, "not json");
        log.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["direction"], "in");
        assert_eq!(entries[0]["json"]["type"], "session.create");
        assert!(entries[0].get("text").is_none());
        assert_eq!(entries[1]["direction"], "out");
        assert_eq!(entries[1]["text"], "not json");
        assert!(entries[1]["timestamp"].as_u64().unwrap() > 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_appends_across_opens() {
        let path = temp_log_path("append");
        std::fs::remove_file(&path).ok();

        for _ in 0..2 {
            let log = TrafficLog::open(&path).unwrap();
            log.record(Direction::In, "{}");
            log.flush().unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        std::fs::remove_file(&path).ok();
    }
}
