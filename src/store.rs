//! Crash-safe persistence of the path → snapshot baseline cache.
//!
//! On-disk layout under the snapshot directory:
//! - `snapshots.bin`: primary document
//! - `snapshots.backup.bin`: the primary as it was before the latest save
//! - `snapshots_<timestamp>.bin`: optional point-in-time copies
//!
//! Every document is `MAGIC` followed by a zstd-compressed bincode [`SnapshotDocument`].

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::model::FileSnapshot;

pub const MAGIC: &[u8; 8] = b"SNAPDB01";
pub const FORMAT_VERSION: u32 = 1;

const PRIMARY_FILE: &str = "snapshots.bin";
const BACKUP_FILE: &str = "snapshots.backup.bin";
const TIMESTAMPED_PREFIX: &str = "snapshots_";

pub type SnapshotMap = HashMap<String, FileSnapshot>;

#[derive(Debug, Serialize)]
struct SnapshotDocumentRef<'a> {
    version: u32,
    saved_at: SystemTime,
    snapshots: &'a SnapshotMap,
}

#[derive(Debug, Deserialize)]
struct SnapshotDocument {
    version: u32,
    saved_at: SystemTime,
    snapshots: SnapshotMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStats {
    pub total_snapshots: usize,
    pub oldest_snapshot: Option<DateTime<Utc>>,
    pub newest_snapshot: Option<DateTime<Utc>>,
    pub snapshot_dir: PathBuf,
    pub retention_days: u32,
    pub disk_usage_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retention_days: u32,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            dir: dir.into(),
            retention_days,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(PRIMARY_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE)
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86_400)
    }

    /// Read the baseline cache. Falls back to the backup when the primary is
    /// missing or corrupt, drops entries past the retention horizon, and yields
    /// an empty map when nothing usable is found. Never fails.
    pub fn load(&self) -> SnapshotMap {
        let primary = self.primary_path();
        let backup = self.backup_path();

        let loaded = match read_document(&primary) {
            Ok(Some(map)) => Some(map),
            Ok(None) => {
                debug!(path = %primary.display(), "no primary snapshot document");
                None
            }
            Err(e) => {
                warn!(path = %primary.display(), error = %e, "primary snapshot document unusable");
                None
            }
        };

        let loaded = loaded.or_else(|| match read_document(&backup) {
            Ok(Some(map)) => {
                info!(path = %backup.display(), "loaded snapshots from backup document");
                Some(map)
            }
            Ok(None) => None,
            Err(e) => {
                error!(path = %backup.display(), error = %e, "backup snapshot document unusable");
                None
            }
        });

        let Some(snapshots) = loaded else {
            info!("no existing snapshots found, starting with an empty baseline");
            return SnapshotMap::new();
        };

        let total = snapshots.len();
        let kept = self.prune(snapshots, SystemTime::now());
        if kept.len() != total {
            info!(dropped = total - kept.len(), "dropped expired or inconsistent snapshots");
        }
        info!(snapshots = kept.len(), "loaded snapshots from disk");
        kept
    }

    /// Persist `snapshots` as the new primary.
    ///
    /// The current primary is copied into the backup slot first, and only if it
    /// still decodes, so the backup always holds the last known-good state. The
    /// new primary is written to a temp file and renamed over the old one.
    pub fn save(&self, snapshots: &SnapshotMap) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))
            .map_err(persistence)?;

        let primary = self.primary_path();
        if primary.exists() {
            match read_document(&primary) {
                Ok(Some(_)) => self.rotate_backup(&primary)?,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "current primary is corrupt, keeping existing backup");
                }
            }
        }

        let encoded = encode(snapshots)?;
        write_atomically(&primary, &encoded)?;

        self.clean_old_timestamped_backups();
        debug!(snapshots = snapshots.len(), path = %primary.display(), "saved snapshots");
        Ok(())
    }

    fn rotate_backup(&self, primary: &Path) -> Result<()> {
        let backup = self.backup_path();
        let staging = backup.with_extension("bin.tmp");
        std::fs::copy(primary, &staging)
            .and_then(|_| std::fs::rename(&staging, &backup))
            .with_context(|| format!("failed to rotate {} into backup slot", primary.display()))
            .map_err(persistence)
    }

    /// Write a point-in-time copy, `snapshots_<timestamp>.bin`.
    pub fn create_timestamped_backup(&self, snapshots: &SnapshotMap) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))
            .map_err(persistence)?;

        let stamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S%.3f");
        let path = self.dir.join(format!("{TIMESTAMPED_PREFIX}{stamp}.bin"));
        write_atomically(&path, &encode(snapshots)?)?;
        info!(path = %path.display(), snapshots = snapshots.len(), "created timestamped snapshot backup");
        Ok(path)
    }

    /// Drop expired and inconsistent entries from `snapshots`.
    pub fn prune(&self, snapshots: SnapshotMap, now: SystemTime) -> SnapshotMap {
        let retention = self.retention();
        snapshots
            .into_iter()
            .filter(|(path, snap)| {
                if !snap.is_consistent() || snap.path() != path.as_str() {
                    warn!(path = %path, "discarding inconsistent snapshot entry");
                    return false;
                }
                !snap.is_older_than(retention, now)
            })
            .collect()
    }

    /// Load, prune and re-save. Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let before = read_document(&self.primary_path())
            .ok()
            .flatten()
            .map(|m| m.len())
            .unwrap_or(0);
        let kept = self.load();
        self.save(&kept)?;
        Ok(before.saturating_sub(kept.len()))
    }

    pub fn stats(&self) -> SnapshotStats {
        let snapshots = self.load();
        let times = snapshots.values().map(|s| s.snapshot_time());
        let oldest = times.clone().min().map(DateTime::<Utc>::from);
        let newest = times.max().map(DateTime::<Utc>::from);

        let disk_usage_bytes = WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();

        SnapshotStats {
            total_snapshots: snapshots.len(),
            oldest_snapshot: oldest,
            newest_snapshot: newest,
            snapshot_dir: self.dir.clone(),
            retention_days: self.retention_days,
            disk_usage_bytes,
        }
    }

    fn clean_old_timestamped_backups(&self) {
        let Some(cutoff) = SystemTime::now().checked_sub(self.retention()) else {
            return;
        };
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list snapshot directory");
                return;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(TIMESTAMPED_PREFIX) {
                continue;
            }
            // Unreadable mtime counts as expired.
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|t| t < cutoff)
                .unwrap_or(true);
            if expired {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => debug!(file = %name.to_string_lossy(), "deleted old snapshot backup"),
                    Err(e) => warn!(file = %name.to_string_lossy(), error = %e, "failed to delete old snapshot backup"),
                }
            }
        }
    }
}

fn persistence(e: anyhow::Error) -> SyncError {
    SyncError::persistence(format!("{e:#}"))
}

fn encode(snapshots: &SnapshotMap) -> Result<Vec<u8>> {
    let document = SnapshotDocumentRef {
        version: FORMAT_VERSION,
        saved_at: SystemTime::now(),
        snapshots,
    };
    let encoded = bincode::serialize(&document)
        .context("failed to serialize snapshot document")
        .map_err(persistence)?;
    let compressed = zstd::bulk::compress(&encoded, 3)
        .context("failed to compress snapshot document")
        .map_err(persistence)?;

    let mut out = Vec::with_capacity(MAGIC.len() + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decode(raw: &[u8]) -> Result<SnapshotMap> {
    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(SyncError::persistence("missing magic header"));
    }

    let decoder = zstd::Decoder::new(&raw[MAGIC.len()..])
        .context("failed to create zstd decoder")
        .map_err(persistence)?;
    let document: SnapshotDocument = bincode::deserialize_from(decoder)
        .context("failed to deserialize snapshot document")
        .map_err(persistence)?;

    if document.version != FORMAT_VERSION {
        return Err(SyncError::persistence(format!(
            "unsupported snapshot document version: {} (expected {})",
            document.version, FORMAT_VERSION
        )));
    }
    debug!(
        saved_at = %DateTime::<Utc>::from(document.saved_at),
        snapshots = document.snapshots.len(),
        "decoded snapshot document"
    );
    Ok(document.snapshots)
}

/// `Ok(None)` when the document does not exist.
fn read_document(path: &Path) -> Result<Option<SnapshotMap>> {
    match std::fs::read(path) {
        Ok(raw) => decode(&raw).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::persistence(format!("{}: {}", path.display(), e))),
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = path.with_extension("tmp");
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp, path)
    };
    write()
        .with_context(|| format!("failed to write {}", path.display()))
        .map_err(persistence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn snap(path: &str, size: u64) -> FileSnapshot {
        let blocks = crate::model::block_count(size, 4) as usize;
        FileSnapshot::new(path, size, SystemTime::UNIX_EPOCH, [size as u8; 32], vec![[1; 32]; blocks], 4)
            .unwrap()
    }

    fn map(entries: &[FileSnapshot]) -> SnapshotMap {
        entries.iter().map(|s| (s.path().to_string(), s.clone())).collect()
    }

    #[test]
    fn test_load_without_documents_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path().join("snapshots"), 30);
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path(), 30);
        let saved = map(&[snap("a.txt", 10), snap("dir/b.bin", 0)]);
        store.save(&saved).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_backup_holds_previous_primary() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path(), 30);
        let first = map(&[snap("a.txt", 10)]);
        let second = map(&[snap("a.txt", 10), snap("b.txt", 3)]);

        store.save(&first).unwrap();
        assert!(!store.backup_path().exists());
        store.save(&second).unwrap();

        let backup = read_document(&store.backup_path()).unwrap().unwrap();
        assert_eq!(backup, first);
        assert_eq!(store.load(), second);
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_backup() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path(), 30);
        let first = map(&[snap("a.txt", 10)]);
        store.save(&first).unwrap();
        store.save(&map(&[snap("b.txt", 2)])).unwrap();

        fs::write(store.primary_path(), b"garbage").unwrap();
        assert_eq!(store.load(), first);
    }

    #[test]
    fn test_corrupt_primary_does_not_overwrite_backup() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path(), 30);
        let first = map(&[snap("a.txt", 10)]);
        store.save(&first).unwrap();
        store.save(&first).unwrap();

        fs::write(store.primary_path(), b"SNAPDB01 but broken").unwrap();
        store.save(&map(&[snap("c.txt", 1)])).unwrap();
        assert_eq!(read_document(&store.backup_path()).unwrap().unwrap(), first);
    }

    #[test]
    fn test_total_failure_yields_empty() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path(), 30);
        fs::write(store.primary_path(), b"junk").unwrap();
        fs::write(store.backup_path(), b"more junk").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_expired_entries_dropped_on_load() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path(), 30);
        let old = snap("old.txt", 1)
            .with_snapshot_time(SystemTime::now() - Duration::from_secs(40 * 86_400));
        let fresh = snap("fresh.txt", 1);
        store.save(&map(&[old, fresh.clone()])).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("fresh.txt"), Some(&fresh));
    }

    #[test]
    fn test_timestamped_backup_and_stats() {
        let temp = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp.path(), 30);
        let snapshots = map(&[snap("a.txt", 10)]);
        store.save(&snapshots).unwrap();

        let path = store.create_timestamped_backup(&snapshots).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("snapshots_"));
        assert_eq!(read_document(&path).unwrap().unwrap(), snapshots);

        let stats = store.stats();
        assert_eq!(stats.total_snapshots, 1);
        assert!(stats.oldest_snapshot.is_some());
        assert!(stats.disk_usage_bytes > 0);
    }
}
