//! Audit records and sinks.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit record outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    /// Action succeeded.
    Success,

    /// Action was refused before any side effect.
    Rejected,

    /// Action failed part way.
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "SUCCESS",
            AuditOutcome::Rejected => "REJECTED",
            AuditOutcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Acting user, or `system` for background work.
    pub user_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Create a successful record.
    pub fn new(
        user_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: user_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            action: action.into(),
            outcome: AuditOutcome::Success,
            before_state: None,
            after_state: None,
            error: None,
        }
    }

    /// Attach the state before the action. Values that fail to serialize
    /// are recorded as null.
    pub fn before<T: Serialize>(mut self, state: &T) -> Self {
        self.before_state = Some(serde_json::to_value(state).unwrap_or_default());
        self
    }

    /// Attach the state after the action.
    pub fn after<T: Serialize>(mut self, state: &T) -> Self {
        self.after_state = Some(serde_json::to_value(state).unwrap_or_default());
        self
    }

    /// Mark the action as failed.
    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.outcome = AuditOutcome::Failed;
        self.error = Some(error.to_string());
        self
    }

    /// Mark the action as refused.
    pub fn rejected(mut self, error: impl fmt::Display) -> Self {
        self.outcome = AuditOutcome::Rejected;
        self.error = Some(error.to_string());
        self
    }
}

/// Append-only audit destination.
pub trait AuditSink: Send + Sync {
    /// Append a record. The record is durable once this returns.
    fn append(&self, record: &AuditRecord) -> io::Result<()>;
}

/// JSON-lines audit log, synced after every record.
pub struct FileAuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditLog {
    /// Open or create an audit log file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditLog {
    fn append(&self, record: &AuditRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audit writer poisoned"))?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

/// In-memory audit log for testing.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in append order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records with the given action.
    pub fn with_action(&self, action: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.action == action)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> io::Result<()> {
        self.records
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audit log poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Role {
        role: &'static str,
    }

    #[test]
    fn test_record_before_after() {
        let record = AuditRecord::new("alice", "federation_identity", "inst-1", "PROMOTE_PARTNER")
            .before(&Role { role: "PRINCIPLE" })
            .after(&Role { role: "PARTNER" });

        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.before_state.unwrap()["role"], "PRINCIPLE");
        assert_eq!(record.after_state.unwrap()["role"], "PARTNER");
    }

    #[test]
    fn test_failed_record_keeps_error() {
        let record = AuditRecord::new("system", "credential", "c1", "ROTATE").failed("no credential");
        assert_eq!(record.outcome, AuditOutcome::Failed);
        assert_eq!(record.error.as_deref(), Some("no credential"));
    }

    #[test]
    fn test_memory_audit_log() {
        let log = MemoryAuditLog::new();
        log.append(&AuditRecord::new("u", "failover", "1", "CREATE")).unwrap();
        log.append(&AuditRecord::new("u", "failover", "1", "EXECUTE")).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[1].action, "EXECUTE");
        assert_eq!(log.with_action("CREATE").len(), 1);
    }

    #[test]
    fn test_file_audit_log_appends_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.log");

        let log = FileAuditLog::open(&path).unwrap();
        log.append(&AuditRecord::new("u", "node", "n1", "DISCONNECT")).unwrap();
        log.append(&AuditRecord::new("u", "node", "n2", "DISCONNECT").failed("boom"))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].entity_id, "n1");
        assert_eq!(lines[1].outcome, AuditOutcome::Failed);
    }
}
