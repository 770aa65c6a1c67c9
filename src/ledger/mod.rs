//! Sled-backed push ledger.
//!
//! Durable record of every play command the system issues: its correlation id,
//! the target device, the content artifact, and the outcome reported back by
//! the device. Entries are created `Pending` when a submission is admitted,
//! move to `Sent` when the MQTT publish succeeds, and reach `Success`/`Failed`
//! only through an inbound status report carrying the matching correlation id.
//!
//! Two trees: `pushes` maps correlation id to the bincode-serialized entry;
//! `push_log` is a per-device chronological index used for history queries.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::ContentKind;

const TREE_PUSHES: &str = "pushes";
const TREE_PUSH_LOG: &str = "push_log";

pub const LEDGER_SCHEMA_VERSION: u8 = 1;

/// Errors from the ledger persistence layer.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when deserializing an entry with an unexpected schema version.
    #[error("schema mismatch for ledger entry: expected {expected}, got {found}")]
    SchemaMismatch { expected: u8, found: u8 },
}

/// Lifecycle of an issued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushStatus {
    /// Admitted and queued, not yet published to the device.
    Pending,
    /// Published over MQTT; awaiting the device's acknowledgment.
    Sent,
    Success,
    Failed,
}

impl PushStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PushStatus::Success | PushStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Pending => "PENDING",
            PushStatus::Sent => "SENT",
            PushStatus::Success => "SUCCESS",
            PushStatus::Failed => "FAILED",
        }
    }
}

/// Downloadable content artifact, produced by the upload subsystem. The core
/// never inspects it; it is carried verbatim into the play command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    pub size: i64,
    pub md5: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub schema: u8,
    pub correlation_id: String,
    pub device_code: String,
    pub content_id: i64,
    pub content_kind: ContentKind,
    pub submitter_id: i64,
    pub privileged: bool,
    pub status: PushStatus,
    pub error: Option<String>,
    pub artifact: Artifact,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status totals, for the `status` CLI report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub success: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.sent + self.success + self.failed
    }
}

/// Sled-backed ledger store. Opened once at startup and shared by reference.
pub struct PushLedger {
    _db: sled::Db,
    pushes: sled::Tree,
    push_log: sled::Tree,
    path: PathBuf,
}

fn log_key(device_code: &str, issued_at: DateTime<Utc>, correlation_id: &str) -> Vec<u8> {
    let nanos = issued_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| issued_at.timestamp_micros() * 1000);
    let mut key = Vec::with_capacity(device_code.len() + 1 + 8 + correlation_id.len());
    key.extend_from_slice(device_code.as_bytes());
    key.push(0);
    key.extend_from_slice(&nanos.to_be_bytes());
    key.extend_from_slice(correlation_id.as_bytes());
    key
}

impl PushLedger {
    /// Open (or create) the ledger at the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path_ref)?;
        let pushes = db.open_tree(TREE_PUSHES)?;
        let push_log = db.open_tree(TREE_PUSH_LOG)?;
        Ok(Self {
            _db: db,
            pushes,
            push_log,
            path: path_ref.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(entry: &LedgerEntry) -> Result<Vec<u8>, LedgerError> {
        Ok(bincode::serialize(entry)?)
    }

    fn decode(bytes: &[u8]) -> Result<LedgerEntry, LedgerError> {
        let entry: LedgerEntry = bincode::deserialize(bytes)?;
        if entry.schema != LEDGER_SCHEMA_VERSION {
            return Err(LedgerError::SchemaMismatch {
                expected: LEDGER_SCHEMA_VERSION,
                found: entry.schema,
            });
        }
        Ok(entry)
    }

    /// Record a freshly admitted submission in `Pending` state.
    pub fn admit(
        &self,
        correlation_id: &str,
        device_code: &str,
        content_id: i64,
        content_kind: ContentKind,
        submitter_id: i64,
        privileged: bool,
        artifact: Artifact,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            schema: LEDGER_SCHEMA_VERSION,
            correlation_id: correlation_id.to_string(),
            device_code: device_code.to_string(),
            content_id,
            content_kind,
            submitter_id,
            privileged,
            status: PushStatus::Pending,
            error: None,
            artifact,
            issued_at: now,
            updated_at: now,
        };
        self.pushes
            .insert(correlation_id.as_bytes(), Self::encode(&entry)?)?;
        self.push_log.insert(
            log_key(device_code, now, correlation_id),
            correlation_id.as_bytes(),
        )?;
        Ok(entry)
    }

    pub fn get(&self, correlation_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        match self.pushes.get(correlation_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Mark an entry `Sent` after a successful transport publish. A no-op for
    /// entries already past `Pending`, so a scheduled re-publish cannot roll a
    /// terminal status back.
    pub fn mark_sent(&self, correlation_id: &str, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let Some(mut entry) = self.get(correlation_id)? else {
            return Ok(());
        };
        if entry.status != PushStatus::Pending {
            return Ok(());
        }
        entry.status = PushStatus::Sent;
        entry.updated_at = now;
        self.pushes
            .insert(correlation_id.as_bytes(), Self::encode(&entry)?)?;
        Ok(())
    }

    /// Apply a terminal device report. Returns the updated entry, or `None`
    /// when the correlation id is unknown. Entries already in a terminal state
    /// keep their first outcome.
    pub fn apply_report(
        &self,
        correlation_id: &str,
        outcome: PushStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        debug_assert!(outcome.is_terminal());
        let Some(mut entry) = self.get(correlation_id)? else {
            return Ok(None);
        };
        if entry.status.is_terminal() {
            return Ok(Some(entry));
        }
        entry.status = outcome;
        if let Some(message) = error {
            if !message.is_empty() {
                entry.error = Some(message);
            }
        }
        entry.updated_at = now;
        self.pushes
            .insert(correlation_id.as_bytes(), Self::encode(&entry)?)?;
        Ok(Some(entry))
    }

    /// A device's entries, newest first, up to `limit`.
    pub fn history(&self, device_code: &str, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut prefix = Vec::with_capacity(device_code.len() + 1);
        prefix.extend_from_slice(device_code.as_bytes());
        prefix.push(0);

        let mut entries = Vec::new();
        for item in self.push_log.scan_prefix(&prefix).rev() {
            if entries.len() >= limit {
                break;
            }
            let (_, correlation) = item?;
            let correlation_id = String::from_utf8_lossy(&correlation).to_string();
            if let Some(entry) = self.get(&correlation_id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Totals per status across the whole ledger.
    pub fn counts(&self) -> Result<StatusCounts, LedgerError> {
        let mut counts = StatusCounts::default();
        for item in self.pushes.iter() {
            let (_, bytes) = item?;
            let entry = Self::decode(&bytes)?;
            match entry.status {
                PushStatus::Pending => counts.pending += 1,
                PushStatus::Sent => counts.sent += 1,
                PushStatus::Success => counts.success += 1,
                PushStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
