//! Append-only record of per-file outcomes.
//!
//! The engine only needs [`AuditSink::append`]. [`JsonlAuditLog`] is the bundled
//! storage: one JSON object per line, with query, statistics and retention
//! cleanup built on a full scan of the file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{IoContext, Result, SyncError};
use crate::model::{FileDelta, FileSnapshot, Mode};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Failed,
    Skipped,
    Deleted,
}

impl std::str::FromStr for AuditStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(AuditStatus::Success),
            "FAILED" => Ok(AuditStatus::Failed),
            "SKIPPED" => Ok(AuditStatus::Skipped),
            "DELETED" => Ok(AuditStatus::Deleted),
            _ => Err(SyncError::validation("status", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub recorded_at: DateTime<Utc>,
    pub file_name: String,
    pub status: AuditStatus,
    pub operation: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub bytes_transferred: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuditRecord {
    fn base(file_name: &str, status: AuditStatus, operation: &str) -> Self {
        Self {
            recorded_at: Utc::now(),
            file_name: file_name.to_string(),
            status,
            operation: operation.to_string(),
            file_size: 0,
            last_modified: None,
            checksum: None,
            bytes_transferred: 0,
            efficiency: None,
            message: None,
        }
    }

    pub fn transferred(snapshot: &FileSnapshot, delta: &FileDelta, mode: Mode) -> Self {
        Self {
            file_size: snapshot.size(),
            last_modified: Some(snapshot.modified().into()),
            checksum: Some(util::to_hex(snapshot.file_hash())),
            bytes_transferred: delta.bytes_transferred(),
            efficiency: Some(delta.efficiency_percentage()),
            message: Some(format!(
                "{}/{} blocks updated ({:.1}% efficiency)",
                delta.changed_blocks(),
                delta.total_blocks(),
                delta.efficiency_percentage()
            )),
            ..Self::base(snapshot.path(), AuditStatus::Success, &mode.to_string())
        }
    }

    pub fn failed(file_name: &str, message: &str, mode: Mode) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::base(file_name, AuditStatus::Failed, &mode.to_string())
        }
    }

    pub fn skipped(file_name: &str, reason: &str) -> Self {
        Self {
            message: Some(reason.to_string()),
            ..Self::base(file_name, AuditStatus::Skipped, "SKIP")
        }
    }

    pub fn deleted(file_name: &str) -> Self {
        Self {
            message: Some("File deleted during full sync".to_string()),
            ..Self::base(file_name, AuditStatus::Deleted, "DELETE")
        }
    }
}

/// Storage-agnostic outcome sink.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<()>;
}

impl AuditSink for () {
    fn append(&self, _: &AuditRecord) -> Result<()> {
        Ok(())
    }
}

/// Keeps records in memory. Handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditStatistics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub total_bytes_transferred: u64,
    pub average_efficiency: f64,
}

impl AuditStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total as f64 * 100.0
    }
}

/// JSON-lines audit file.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable record in file order. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SyncError::io(&self.path, e)),
        };

        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_path(&self.path)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = number + 1, error = %e, "skipping malformed audit record"),
            }
        }
        Ok(records)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut records = self.read_all()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    pub fn by_status(&self, status: AuditStatus) -> Result<Vec<AuditRecord>> {
        self.filtered(|r| r.status == status)
    }

    pub fn by_operation(&self, operation: &str) -> Result<Vec<AuditRecord>> {
        self.filtered(|r| r.operation.eq_ignore_ascii_case(operation))
    }

    pub fn in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        self.filtered(|r| r.recorded_at >= start && r.recorded_at <= end)
    }

    /// Case-insensitive substring match on the file name.
    pub fn search(&self, pattern: &str) -> Result<Vec<AuditRecord>> {
        let needle = pattern.to_lowercase();
        self.filtered(|r| r.file_name.to_lowercase().contains(&needle))
    }

    pub fn statistics(&self) -> Result<AuditStatistics> {
        let records = self.read_all()?;
        let mut stats = AuditStatistics::default();
        let mut efficiency_sum = 0.0;
        let mut efficiency_count = 0u64;

        for record in &records {
            stats.total += 1;
            match record.status {
                AuditStatus::Success => stats.successful += 1,
                AuditStatus::Failed => stats.failed += 1,
                AuditStatus::Skipped => stats.skipped += 1,
                AuditStatus::Deleted => stats.deleted += 1,
            }
            stats.total_bytes_transferred += record.bytes_transferred;
            if let Some(efficiency) = record.efficiency {
                efficiency_sum += efficiency;
                efficiency_count += 1;
            }
        }
        if efficiency_count > 0 {
            stats.average_efficiency = efficiency_sum / efficiency_count as f64;
        }
        Ok(stats)
    }

    /// Drop records older than `retention_days`. Returns how many were removed.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let records = self.read_all()?;
        let total = records.len();
        let kept: Vec<_> = records.into_iter().filter(|r| r.recorded_at >= cutoff).collect();
        let removed = total - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let temp = self.path.with_extension("jsonl.tmp");
        {
            let file = File::create(&temp).with_path(&temp)?;
            let mut writer = BufWriter::new(file);
            for record in &kept {
                write_record(&mut writer, record)?;
            }
            writer.flush().with_path(&temp)?;
        }
        std::fs::rename(&temp, &self.path).with_path(&self.path)?;

        info!(removed, %cutoff, "cleaned up old audit records");
        Ok(removed)
    }

    fn filtered(&self, keep: impl Fn(&AuditRecord) -> bool) -> Result<Vec<AuditRecord>> {
        Ok(self.read_all()?.into_iter().filter(|r| keep(r)).collect())
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_path(&self.path)?;
        write_record(&mut file, record)?;
        debug!(file = %record.file_name, status = ?record.status, "appended audit record");
        Ok(())
    }
}

fn write_record<W: Write>(writer: &mut W, record: &AuditRecord) -> Result<()> {
    let mut line = serde_json::to_string(record)
        .map_err(|e| SyncError::persistence(format!("failed to encode audit record: {e}")))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .map_err(|e| SyncError::persistence(format!("failed to write audit record: {e}")))
}
