//! Audit trail for operator actions and safety events.
//!
//! Every run, interlock trip, link change and manual actuation is appended
//! to a JSONL file so a test can be reconstructed after the fact.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    ScriptLoaded,
    ScriptRejected,
    RunStarted,
    /// Start refused (no script, initial state mismatch, ...)
    RunRejected,
    RunCompleted,
    RunStopped,
    RunAborted,
    /// Pressure or redline interlock fired
    InterlockTrip,
    LinkUp,
    LinkDown,
    ManualActuation,
    CadenceChange,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Microseconds since the logger was created
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
    started: Instant,
}

fn micros(us: u128) -> u64 {
    u64::try_from(us).unwrap_or(u64::MAX)
}

impl AuditLogger {
    /// The file is opened in append mode to preserve existing logs.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            started: Instant::now(),
        })
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        let unix_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| micros(d.as_micros()))
            .unwrap_or_default();
        self.log(&AuditEntry {
            timestamp_us: micros(self.started.elapsed().as_micros()),
            unix_us,
            event_type,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_audit_logger_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("stand.jsonl");

        let logger = AuditLogger::new(&path).unwrap();
        logger
            .log_event(
                AuditEventType::RunStarted,
                serde_json::json!({"events": 5}),
            )
            .unwrap();
        logger
            .log_event(
                AuditEventType::InterlockTrip,
                serde_json::json!({"device": "PT-OX-01", "actual": 120.0}),
            )
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, AuditEventType::RunStarted);
        assert_eq!(entries[1].details["device"], "PT-OX-01");
        assert!(entries[1].timestamp_us >= entries[0].timestamp_us);
        assert!(content.contains(r#""event_type":"interlock_trip""#));
    }

    #[test]
    fn reopening_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        for _ in 0..2 {
            let logger = AuditLogger::new(&path).unwrap();
            logger
                .log_event(AuditEventType::SystemStart, serde_json::json!({}))
                .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
