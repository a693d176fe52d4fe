//! Timer-driven side jobs.
//!
//! Each job is an ordinary caller of the orchestrator, the snapshot store or the
//! audit log. [`run_scheduler`] drives them on tokio intervals until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::audit::JsonlAuditLog;
use crate::config::Config;
use crate::model::{Direction, Mode};
use crate::orchestrator::{SyncOrchestrator, TransferReport, TransferRun};

const DAY: Duration = Duration::from_secs(24 * 3600);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub backup_every: Duration,
    pub cleanup_every: Duration,
    pub stats_every: Duration,
    pub log_retention_days: u32,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backup_every: Duration::from_secs(config.auto_backup_interval_secs),
            cleanup_every: DAY,
            stats_every: HOUR,
            log_retention_days: config.log_retention_days,
        }
    }
}

/// Incremental DC → DR run. `None` when another run was active.
pub fn auto_backup(orchestrator: &SyncOrchestrator) -> Option<TransferReport> {
    info!("starting scheduled backup");
    match orchestrator.transfer(Direction::DcToDr, Mode::Incremental) {
        TransferRun::Busy => {
            info!("skipping scheduled backup, a transfer is already running");
            None
        }
        TransferRun::Completed(report) => {
            info!(
                transferred = report.transferred(),
                failed = report.failed(),
                "scheduled backup finished"
            );
            Some(report)
        }
        TransferRun::Cancelled(report) => {
            warn!(processed = report.outcomes.len(), "scheduled backup cancelled");
            Some(report)
        }
        TransferRun::Aborted { report, message } => {
            error!(error = %message, "scheduled backup failed");
            Some(report)
        }
    }
}

/// Drop expired snapshot entries. Skipped while a transfer owns the cache.
pub fn cleanup_snapshots(orchestrator: &SyncOrchestrator) -> usize {
    match orchestrator.cleanup_snapshots() {
        Ok(None) => {
            info!("skipping snapshot cleanup, a transfer is running");
            0
        }
        Ok(Some(removed)) => {
            info!(removed, "completed scheduled cleanup of old snapshots");
            removed
        }
        Err(e) => {
            error!(error = %e, "failed to clean up old snapshots");
            0
        }
    }
}

pub fn cleanup_audit_log(audit: &JsonlAuditLog, retention_days: u32) -> usize {
    match audit.cleanup(retention_days) {
        Ok(removed) => {
            info!(removed, "completed scheduled cleanup of transfer logs");
            removed
        }
        Err(e) => {
            error!(error = %e, "failed to clean up transfer logs");
            0
        }
    }
}

pub fn log_statistics(orchestrator: &SyncOrchestrator, audit: &JsonlAuditLog) {
    let snapshots = orchestrator.store().stats();
    info!(
        total = snapshots.total_snapshots,
        disk_bytes = snapshots.disk_usage_bytes,
        "snapshot statistics"
    );
    match audit.statistics() {
        Ok(stats) => info!(
            total = stats.total,
            success = stats.successful,
            failed = stats.failed,
            success_rate = format!("{:.1}%", stats.success_rate()),
            "transfer statistics"
        ),
        Err(e) => error!(error = %e, "failed to read transfer statistics"),
    }
}

fn spawn_job<F>(name: &'static str, job: F)
where
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(job);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            error!(job = name, error = %e, "scheduled job panicked");
        }
    });
}

/// Run the jobs until `shutdown` resolves. The backup fires immediately, the
/// others after their first period. On shutdown an active run is asked to cancel.
pub async fn run_scheduler<F>(
    orchestrator: Arc<SyncOrchestrator>,
    audit: Arc<JsonlAuditLog>,
    schedule: Schedule,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let mut backup = interval(schedule.backup_every);
    backup.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cleanup = interval_at(Instant::now() + schedule.cleanup_every, schedule.cleanup_every);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = interval_at(Instant::now() + schedule.stats_every, schedule.stats_every);
    stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        backup_every_secs = schedule.backup_every.as_secs(),
        "scheduler started"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("scheduler shutting down");
                orchestrator.cancel();
                break;
            }
            _ = backup.tick() => {
                let orchestrator = Arc::clone(&orchestrator);
                spawn_job("auto-backup", move || {
                    auto_backup(&orchestrator);
                });
            }
            _ = cleanup.tick() => {
                let orchestrator = Arc::clone(&orchestrator);
                let audit = Arc::clone(&audit);
                let retention = schedule.log_retention_days;
                spawn_job("cleanup", move || {
                    cleanup_snapshots(&orchestrator);
                    cleanup_audit_log(&audit, retention);
                });
            }
            _ = stats.tick() => {
                let orchestrator = Arc::clone(&orchestrator);
                let audit = Arc::clone(&audit);
                spawn_job("statistics", move || log_statistics(&orchestrator, &audit));
            }
        }
    }
}
