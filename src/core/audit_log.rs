//! Append-only audit sink with file-based persistence.
//!
//! Entries are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. The sink must never silently drop an
//! entry: any append failure surfaces to the orchestrator, which fails
//! the turn rather than proceeding unaudited.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::AuditEntry;

/// Failure to durably record an audit entry. Always fatal for the turn.
#[derive(Debug, Clone, Error)]
#[error("audit sink unavailable: {detail}")]
pub struct AuditSinkError {
    pub detail: String,
}

impl AuditSinkError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Destination for audit entries. Append-only by contract.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably record one entry. Must not return until the entry is
    /// persisted (or persistence has definitively failed).
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditSinkError>;
}

/// File-backed audit log using JSONL format.
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    /// Create or open an audit log at the given path.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuditSinkError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                AuditSinkError::new(format!(
                    "failed to create audit directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        Ok(Self { path })
    }

    /// Path to the underlying JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay all entries in append order.
    pub async fn replay(&self) -> Result<Vec<AuditEntry>, AuditSinkError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await.map_err(|e| {
            AuditSinkError::new(format!("failed to open {}: {}", self.path.display(), e))
        })?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut entries = Vec::new();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AuditSinkError::new(format!("failed to read audit log: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)
                .map_err(|e| AuditSinkError::new(format!("failed to parse entry: {}", e)))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditSinkError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                AuditSinkError::new(format!("failed to open {}: {}", self.path.display(), e))
            })?;

        let json = serde_json::to_string(entry)
            .map_err(|e| AuditSinkError::new(format!("failed to serialize entry: {}", e)))?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(|e| AuditSinkError::new(format!("failed to write entry: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| AuditSinkError::new(format!("failed to flush entry: {}", e)))?;

        Ok(())
    }
}

/// In-process audit sink, used by tests and the demo CLI turn.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries appended so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit lock poisoned").clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditSinkError> {
        self.entries
            .lock()
            .expect("audit lock poisoned")
            .push(entry.clone());
        Ok(())
    }
}
