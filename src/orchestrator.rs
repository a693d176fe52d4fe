//! Single-flight transfer runs between the DC and DR roots.

use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::apply;
use crate::audit::{AuditRecord, AuditSink};
use crate::delta::DeltaEngine;
use crate::detect;
use crate::error::{Result, SyncError};
use crate::model::{Direction, FileSnapshot, Mode, TransferOperation};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::snapshot::SnapshotEngine;
use crate::store::{SnapshotMap, SnapshotStore};
use crate::util::{self, FileEntry};

/// Entries listed by [`SyncOrchestrator::detailed_sync_status`] before truncation.
pub const DETAILED_STATUS_LIMIT: usize = 50;

const MODE_DESCRIPTION: &str = "Incremental (DC→DR), Full (DR→DC)";

/// Result for one file of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Transferred {
        path: String,
        efficiency: f64,
        changed_blocks: u64,
        total_blocks: u64,
        bytes_transferred: u64,
    },
    Unchanged {
        path: String,
    },
    Deleted {
        path: String,
    },
    Failed {
        path: String,
        message: String,
    },
    DeleteFailed {
        path: String,
        message: String,
    },
}

impl FileOutcome {
    pub fn path(&self) -> &str {
        match self {
            FileOutcome::Transferred { path, .. }
            | FileOutcome::Unchanged { path }
            | FileOutcome::Deleted { path }
            | FileOutcome::Failed { path, .. }
            | FileOutcome::DeleteFailed { path, .. } => path,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. } | FileOutcome::DeleteFailed { .. })
    }

    fn status_label(&self) -> &'static str {
        match self {
            FileOutcome::Transferred { .. } => "Transferred",
            FileOutcome::Unchanged { .. } => "Unchanged",
            FileOutcome::Deleted { .. } => "Deleted",
            FileOutcome::Failed { .. } | FileOutcome::DeleteFailed { .. } => "Error",
        }
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOutcome::Transferred {
                path, efficiency, ..
            } => write!(f, "✓ {path} ({efficiency:.1}% efficiency)"),
            FileOutcome::Unchanged { path } => write!(f, "○ {path} (unchanged)"),
            FileOutcome::Deleted { path } => write!(f, "✗ Deleted: {path}"),
            FileOutcome::Failed { path, message } => write!(f, "✗ ERROR: {path} - {message}"),
            FileOutcome::DeleteFailed { path, message } => {
                write!(f, "✗ ERROR deleting {path}: {message}")
            }
        }
    }
}

/// Outcomes of one run, transfers before deletions.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub operation: TransferOperation,
    pub outcomes: Vec<FileOutcome>,
    pub elapsed: Duration,
}

impl TransferReport {
    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    pub fn transferred(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Transferred { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Unchanged { .. }))
    }

    pub fn deleted(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Deleted { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(FileOutcome::is_failure)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                FileOutcome::Transferred {
                    bytes_transferred, ..
                } => *bytes_transferred,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub enum TransferRun {
    /// Another run held the single-flight flag. Nothing was touched.
    Busy,
    Completed(TransferReport),
    /// Stopped between files by [`SyncOrchestrator::cancel`]. Deletions were skipped.
    Cancelled(TransferReport),
    /// A run-level failure stopped the run after the outcomes in `report`.
    Aborted {
        report: TransferReport,
        message: String,
    },
}

impl TransferRun {
    pub fn is_busy(&self) -> bool {
        matches!(self, TransferRun::Busy)
    }

    pub fn report(&self) -> Option<&TransferReport> {
        match self {
            TransferRun::Busy => None,
            TransferRun::Completed(report)
            | TransferRun::Cancelled(report)
            | TransferRun::Aborted { report, .. } => Some(report),
        }
    }

    /// One human-readable line per outcome, plus a trailer for non-completed runs.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .report()
            .map(|r| r.outcomes.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        match self {
            TransferRun::Busy => lines.push("Transfer already in progress".to_string()),
            TransferRun::Completed(_) => {}
            TransferRun::Cancelled(_) => lines.push("Transfer cancelled".to_string()),
            TransferRun::Aborted { message, .. } => lines.push(format!("Transfer failed: {message}")),
        }
        lines
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub synced_files: usize,
    pub out_of_sync_files: usize,
    pub total_files: usize,
    pub tracked_snapshots: usize,
    pub mode: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    MissingInDr,
    MissingInDc,
    ContentDiffers,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileState::MissingInDr => f.pad("MISSING_IN_DR"),
            FileState::MissingInDc => f.pad("MISSING_IN_DC"),
            FileState::ContentDiffers => f.pad("CONTENT_DIFFERS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub path: String,
    pub state: FileState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailedSyncStatus {
    #[serde(flatten)]
    pub summary: SyncStatus,
    pub files: Vec<FileStatus>,
    /// Out-of-sync entries beyond [`DETAILED_STATUS_LIMIT`].
    pub omitted: usize,
}

enum RunEnd {
    Completed,
    Cancelled,
}

/// Clears the running flag on drop, including during unwinding.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Coordinates snapshotting, diffing and applying across the two roots.
///
/// One run at a time: a second call while a run is active returns
/// [`TransferRun::Busy`] immediately. The baseline cache is shared between both
/// directions and keyed by relative path.
pub struct SyncOrchestrator {
    dc_root: PathBuf,
    dr_root: PathBuf,
    snapshots: SnapshotEngine,
    deltas: DeltaEngine,
    store: SnapshotStore,
    progress: Arc<dyn ProgressSink>,
    audit: Arc<dyn AuditSink>,
    cache: RwLock<SnapshotMap>,
    running: AtomicBool,
    cancel_requested: AtomicBool,
}

impl SyncOrchestrator {
    /// Builds the orchestrator and seeds the cache from `store`. Loading only
    /// reads the store, so an unusable document yields an empty cache.
    ///
    /// # Panics
    /// Panics if `block_size` is zero.
    pub fn new(
        dc_root: impl Into<PathBuf>,
        dr_root: impl Into<PathBuf>,
        block_size: usize,
        store: SnapshotStore,
    ) -> Self {
        let cache = store.load();
        Self {
            dc_root: dc_root.into(),
            dr_root: dr_root.into(),
            snapshots: SnapshotEngine::new(block_size),
            deltas: DeltaEngine::new(block_size),
            store,
            progress: Arc::new(()),
            audit: Arc::new(()),
            cache: RwLock::new(cache),
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn dc_root(&self) -> &Path {
        &self.dc_root
    }

    pub fn dr_root(&self) -> &Path {
        &self.dr_root
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn is_transfer_in_progress(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the active run to stop before its next file. No effect when idle.
    pub fn cancel(&self) {
        if self.is_transfer_in_progress() {
            info!("cancellation requested");
            self.cancel_requested.store(true, Ordering::Release);
        }
    }

    /// Number of entries in the in-memory baseline cache.
    pub fn tracked_snapshots(&self) -> usize {
        self.cache_read().len()
    }

    /// Drop expired entries from the store and the cache.
    ///
    /// Holds the single-flight flag so no run can save in between. `None` when a
    /// transfer is active.
    pub fn cleanup_snapshots(&self) -> Result<Option<usize>> {
        let Some(_guard) = self.try_begin() else {
            return Ok(None);
        };
        let removed = self.store.cleanup_expired()?;
        *self.cache_write() = self.store.load();
        Ok(Some(removed))
    }

    /// Run a transfer from raw direction and mode tokens.
    ///
    /// The single-flight flag is taken before the tokens are parsed, so a busy
    /// orchestrator answers [`TransferRun::Busy`] even for malformed input.
    /// Malformed tokens fail with [`SyncError::Validation`] before any I/O.
    pub fn perform_transfer(&self, direction: &str, mode: Option<&str>) -> Result<TransferRun> {
        let Some(_guard) = self.try_begin() else {
            info!("transfer already in progress, rejecting request");
            return Ok(TransferRun::Busy);
        };
        let direction: Direction = direction.parse()?;
        let mode = Mode::parse(mode)?;
        Ok(self.execute(&TransferOperation::new(
            direction,
            mode,
            &self.dc_root,
            &self.dr_root,
        )))
    }

    /// Typed entry point for callers that already hold a parsed direction and mode.
    pub fn transfer(&self, direction: Direction, mode: Mode) -> TransferRun {
        let Some(_guard) = self.try_begin() else {
            info!("transfer already in progress, rejecting request");
            return TransferRun::Busy;
        };
        self.execute(&TransferOperation::new(
            direction,
            mode,
            &self.dc_root,
            &self.dr_root,
        ))
    }

    fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                self.cancel_requested.store(false, Ordering::Release);
                RunGuard(&self.running)
            })
    }

    fn execute(&self, op: &TransferOperation) -> TransferRun {
        let started = Instant::now();
        info!(
            operation = %op.description(),
            source = %op.source_root().display(),
            target = %op.target_root().display(),
            "starting transfer"
        );

        let loaded = self.store.load();
        *self.cache_write() = loaded;

        let mut tracker = ProgressTracker::new(self.progress.as_ref());
        let mut outcomes = Vec::new();
        let end = self.run_steps(op, &mut tracker, &mut outcomes);

        // Completed files are reflected in the cache even when the run stops early.
        if let Err(e) = self.store.save(&self.cache_read()) {
            error!(error = %e, "failed to persist snapshots, next run will use a stale baseline");
        }

        let report = TransferReport {
            operation: op.clone(),
            outcomes,
            elapsed: started.elapsed(),
        };

        match end {
            Ok(RunEnd::Completed) => {
                tracker.finish("Transfer completed successfully");
                info!(
                    transferred = report.transferred(),
                    unchanged = report.unchanged(),
                    deleted = report.deleted(),
                    failed = report.failed(),
                    bytes = report.bytes_transferred(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "transfer completed"
                );
                TransferRun::Completed(report)
            }
            Ok(RunEnd::Cancelled) => {
                tracker.error("Transfer cancelled");
                warn!(processed = report.outcomes.len(), "transfer cancelled");
                TransferRun::Cancelled(report)
            }
            Err(e) => {
                let message = e.to_string();
                tracker.error(&message);
                error!(error = %message, "transfer aborted");
                TransferRun::Aborted { report, message }
            }
        }
    }

    fn run_steps(
        &self,
        op: &TransferOperation,
        tracker: &mut ProgressTracker<'_>,
        outcomes: &mut Vec<FileOutcome>,
    ) -> Result<RunEnd> {
        let candidates = if op.is_full() {
            let files = detect::detect_all_files(op.source_root())?;
            self.purge_stale_entries(&files);
            files
        } else {
            detect::detect_changed_files(op.source_root(), op.target_root())?
        };

        tracker.start(
            candidates.len(),
            util::total_bytes(&candidates),
            &op.description(),
        );

        for entry in &candidates {
            if self.cancel_requested.load(Ordering::Acquire) {
                return Ok(RunEnd::Cancelled);
            }

            let outcome = match self.transfer_file(op, entry) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(path = %entry.relative_path, error = %e, "failed to transfer file");
                    let message = e.to_string();
                    self.record(&AuditRecord::failed(&entry.relative_path, &message, op.mode()));
                    FileOutcome::Failed {
                        path: entry.relative_path.clone(),
                        message,
                    }
                }
            };
            tracker.update(&entry.relative_path, outcome.status_label(), entry.size);
            outcomes.push(outcome);
        }

        if op.is_full() {
            let deleted = detect::detect_deleted_files(op.source_root(), op.target_root())?;
            for entry in &deleted {
                if self.cancel_requested.load(Ordering::Acquire) {
                    return Ok(RunEnd::Cancelled);
                }
                outcomes.push(self.delete_file(entry));
            }
        }

        Ok(RunEnd::Completed)
    }

    fn transfer_file(&self, op: &TransferOperation, entry: &FileEntry) -> Result<FileOutcome> {
        let rel = &entry.relative_path;
        let snapshot = self.snapshots.create_snapshot(&entry.full_path, rel)?;
        let cached = self.cache_read().get(rel).cloned();

        if !op.is_full() && !self.snapshots.needs_transfer(&snapshot, cached.as_ref()) {
            self.record(&AuditRecord::skipped(rel, "unchanged since last snapshot"));
            return Ok(FileOutcome::Unchanged { path: rel.clone() });
        }

        let target = util::resolve(op.target_root(), rel);
        let baseline = if target.exists() {
            cached.as_ref()
        } else {
            debug!(path = %rel, "target absent, ignoring cached baseline");
            None
        };

        let delta = self.deltas.calculate_delta(&entry.full_path, baseline, rel)?;
        apply::apply_delta(&target, &delta)?;

        self.record(&AuditRecord::transferred(&snapshot, &delta, op.mode()));
        self.cache_write().insert(rel.clone(), snapshot);

        info!(
            path = %rel,
            changed = delta.changed_blocks(),
            total = delta.total_blocks(),
            efficiency = format!("{:.1}%", delta.efficiency_percentage()),
            "transferred"
        );
        Ok(FileOutcome::Transferred {
            path: rel.clone(),
            efficiency: delta.efficiency_percentage(),
            changed_blocks: delta.changed_blocks(),
            total_blocks: delta.total_blocks(),
            bytes_transferred: delta.bytes_transferred(),
        })
    }

    fn delete_file(&self, entry: &FileEntry) -> FileOutcome {
        let rel = &entry.relative_path;
        match std::fs::remove_file(&entry.full_path) {
            Ok(()) => {
                self.cache_write().remove(rel);
                self.record(&AuditRecord::deleted(rel));
                info!(path = %rel, "deleted file absent from source");
                FileOutcome::Deleted { path: rel.clone() }
            }
            Err(e) => {
                let message = SyncError::io(&entry.full_path, e).to_string();
                error!(path = %rel, error = %message, "failed to delete file");
                self.record(&AuditRecord::failed(rel, &message, Mode::Full));
                FileOutcome::DeleteFailed {
                    path: rel.clone(),
                    message,
                }
            }
        }
    }

    /// Drop cache entries with no file under the source root.
    fn purge_stale_entries(&self, source_files: &[FileEntry]) {
        let present = util::path_set(source_files);
        let mut cache = self.cache_write();
        let before = cache.len();
        cache.retain(|path, _| present.contains(path));
        let purged = before - cache.len();
        if purged > 0 {
            info!(purged, "purged cached snapshots missing from source");
        }
    }

    fn record(&self, record: &AuditRecord) {
        if let Err(e) = self.audit.append(record) {
            warn!(file = %record.file_name, error = %e, "failed to append audit record");
        }
    }

    fn cache_read(&self) -> RwLockReadGuard<'_, SnapshotMap> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_write(&self) -> RwLockWriteGuard<'_, SnapshotMap> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached baseline for `relative_path`, if any.
    pub fn cached_snapshot(&self, relative_path: &str) -> Option<FileSnapshot> {
        self.cache_read().get(relative_path).cloned()
    }

    /// Read-only comparison of the two roots. Never touches the cache or the store.
    pub fn sync_status(&self) -> Result<SyncStatus> {
        let (summary, _) = self.compare_roots()?;
        Ok(summary)
    }

    /// [`Self::sync_status`] plus the first [`DETAILED_STATUS_LIMIT`] out-of-sync files.
    pub fn detailed_sync_status(&self) -> Result<DetailedSyncStatus> {
        let (summary, mut files) = self.compare_roots()?;
        let omitted = files.len().saturating_sub(DETAILED_STATUS_LIMIT);
        files.truncate(DETAILED_STATUS_LIMIT);
        Ok(DetailedSyncStatus {
            summary,
            files,
            omitted,
        })
    }

    fn compare_roots(&self) -> Result<(SyncStatus, Vec<FileStatus>)> {
        if !self.dc_root.is_dir() || !self.dr_root.is_dir() {
            return Err(SyncError::RunLevel {
                message: "one or both directories do not exist".to_string(),
            });
        }

        let dc_files = util::walk_files(&self.dc_root)?;
        let dr_files = util::walk_files(&self.dr_root)?;
        let dc_paths = util::path_set(&dc_files);
        let dr_paths = util::path_set(&dr_files);

        let mut files: Vec<FileStatus> = dc_files
            .par_iter()
            .filter_map(|entry| {
                let counterpart = util::resolve(&self.dr_root, &entry.relative_path);
                let state = if !dr_paths.contains(&entry.relative_path) {
                    FileState::MissingInDr
                } else if detect::are_files_different(&entry.full_path, &counterpart) {
                    FileState::ContentDiffers
                } else {
                    return None;
                };
                Some(FileStatus {
                    path: entry.relative_path.clone(),
                    state,
                })
            })
            .collect();

        files.extend(
            dr_files
                .iter()
                .filter(|entry| !dc_paths.contains(&entry.relative_path))
                .map(|entry| FileStatus {
                    path: entry.relative_path.clone(),
                    state: FileState::MissingInDc,
                }),
        );

        let total_files = dc_paths.union(&dr_paths).count();
        let summary = SyncStatus {
            synced_files: total_files.saturating_sub(files.len()),
            out_of_sync_files: files.len(),
            total_files,
            tracked_snapshots: self.tracked_snapshots(),
            mode: MODE_DESCRIPTION.to_string(),
        };
        debug!(
            total = summary.total_files,
            out_of_sync = summary.out_of_sync_files,
            "computed sync status"
        );
        Ok((summary, files))
    }
}
