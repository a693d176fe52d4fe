use anyhow::{bail, Context};
use blocksync::audit::{AuditStatus, JsonlAuditLog};
use blocksync::config::Config;
use blocksync::maintenance::{self, Schedule};
use blocksync::orchestrator::{SyncOrchestrator, TransferRun};
use blocksync::progress::{format_duration, LogProgress};
use blocksync::store::SnapshotStore;
use blocksync::{logging, AuditRecord};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "blocksync",
    about = "Block-level incremental sync between DC and DR directory trees"
)]
struct Cli {
    /// Path to a TOML config file (default: ./blocksync.toml if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    /// DC (source-of-truth) root, overrides the config file
    #[arg(long, global = true)]
    dc: Option<PathBuf>,
    /// DR (disaster-recovery) root, overrides the config file
    #[arg(long, global = true)]
    dr: Option<PathBuf>,
    /// Snapshot directory, overrides the config file
    #[arg(long, global = true)]
    snapshot_dir: Option<PathBuf>,
    /// Block size in bytes, overrides the config file
    #[arg(long, global = true)]
    block_size: Option<usize>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one transfer between the DC and DR roots
    Transfer {
        /// DC_TO_DR, BACKUP, DR_TO_DC, RECOVERY or RESTORE
        #[arg(long, short)]
        direction: String,
        /// incremental (default) or full
        #[arg(long, short)]
        mode: Option<String>,
    },
    /// Compare the two roots without changing anything
    Status {
        /// List out-of-sync files
        #[arg(long)]
        detailed: bool,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run scheduled backup and maintenance jobs until interrupted
    Schedule {
        /// Seconds between incremental DC → DR backups
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Query the transfer audit log
    Logs {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Inspect and maintain the snapshot store
    Snapshots {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Most recent records, newest first
    Recent {
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
    /// Records with the given status (success, failed, skipped, deleted)
    Status { status: String },
    /// Records whose file name contains a pattern
    Search { pattern: String },
    /// Records from the last N hours
    Since {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Aggregate statistics
    Stats,
    /// Remove records older than the retention period
    Cleanup {
        /// Override log_retention_days
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Entry count, age range and disk usage
    Stats,
    /// Drop snapshots past the retention period
    Cleanup,
    /// Write a timestamped copy of the current snapshot document
    Backup,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dc) = &cli.dc {
        config.dc_path = Some(dc.clone());
    }
    if let Some(dr) = &cli.dr {
        config.dr_path = Some(dr.clone());
    }
    if let Some(dir) = &cli.snapshot_dir {
        config.snapshot_dir = dir.clone();
    }
    if let Some(block_size) = cli.block_size {
        config.block_size = block_size;
    }
    config.validate()?;
    Ok(config)
}

fn snapshot_store(config: &Config) -> SnapshotStore {
    SnapshotStore::new(&config.snapshot_dir, config.snapshot_retention_days)
}

fn build_orchestrator(
    config: &Config,
    audit: Arc<JsonlAuditLog>,
) -> anyhow::Result<Arc<SyncOrchestrator>> {
    let (dc, dr) = config.roots()?;
    let orchestrator = SyncOrchestrator::new(dc, dr, config.block_size, snapshot_store(config))
        .with_progress(Arc::new(LogProgress))
        .with_audit(audit);
    Ok(Arc::new(orchestrator))
}

fn print_records(records: &[AuditRecord]) {
    if records.is_empty() {
        println!("No records.");
        return;
    }
    for r in records {
        let detail = r.message.as_deref().unwrap_or("");
        println!(
            "{}  {:<8} {:<11} {}  {}",
            r.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", r.status).to_uppercase(),
            r.operation,
            r.file_name,
            detail
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;
    let config = load_config(&cli)?;
    let audit = Arc::new(JsonlAuditLog::new(config.audit_log_path()));

    match cli.command {
        Commands::Transfer { direction, mode } => {
            let orchestrator = build_orchestrator(&config, audit)?;
            println!("Starting transfer...");
            println!("  DC: {}", orchestrator.dc_root().display());
            println!("  DR: {}", orchestrator.dr_root().display());
            println!("  Direction: {direction}");
            println!("  Mode: {}", mode.as_deref().unwrap_or("incremental"));

            let start = Instant::now();
            let run = tokio::task::spawn_blocking(move || {
                orchestrator.perform_transfer(&direction, mode.as_deref())
            })
            .await
            .context("transfer task panicked")??;
            let elapsed = start.elapsed();

            println!();
            for line in run.lines() {
                println!("  {line}");
            }

            match &run {
                TransferRun::Busy => bail!("Transfer already in progress"),
                TransferRun::Aborted { message, .. } => bail!("Transfer failed: {message}"),
                TransferRun::Completed(report) | TransferRun::Cancelled(report) => {
                    println!("\n{} finished!", report.operation.description());
                    println!("  Files transferred: {}", report.transferred());
                    println!("  Files unchanged: {}", report.unchanged());
                    println!("  Files deleted: {}", report.deleted());
                    println!("  Errors: {}", report.failed());
                    println!("  Bytes written: {}", report.bytes_transferred());
                    println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
                    if report.failed() > 0 {
                        bail!("{} file(s) failed to transfer", report.failed());
                    }
                }
            }
        }
        Commands::Status { detailed, json } => {
            let orchestrator = build_orchestrator(&config, audit)?;
            if detailed {
                let status = orchestrator.detailed_sync_status()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    println!("Sync status ({})", status.summary.mode);
                    println!("  Synced files: {}", status.summary.synced_files);
                    println!("  Out of sync: {}", status.summary.out_of_sync_files);
                    println!("  Total files: {}", status.summary.total_files);
                    println!("  Tracked snapshots: {}", status.summary.tracked_snapshots);
                    for file in &status.files {
                        println!("  {:<15} {}", file.state, file.path);
                    }
                    if status.omitted > 0 {
                        println!("  ... and {} more files", status.omitted);
                    }
                }
            } else {
                let status = orchestrator.sync_status()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    println!("Sync status ({})", status.mode);
                    println!("  Synced files: {}", status.synced_files);
                    println!("  Out of sync: {}", status.out_of_sync_files);
                    println!("  Total files: {}", status.total_files);
                    println!("  Tracked snapshots: {}", status.tracked_snapshots);
                }
            }
        }
        Commands::Schedule { interval } => {
            let mut config = config;
            if let Some(secs) = interval {
                config.auto_backup_interval_secs = secs;
                config.validate()?;
            }
            let schedule = Schedule::from_config(&config);
            let orchestrator = build_orchestrator(&config, audit.clone())?;
            println!(
                "Scheduler running, backup every {}. Press Ctrl-C to stop.",
                format_duration(schedule.backup_every)
            );
            maintenance::run_scheduler(orchestrator, audit, schedule, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
            })
            .await;
        }
        Commands::Logs { command } => match command {
            LogCommands::Recent { limit } => print_records(&audit.recent(limit)?),
            LogCommands::Status { status } => {
                let status: AuditStatus = status.parse()?;
                print_records(&audit.by_status(status)?);
            }
            LogCommands::Search { pattern } => print_records(&audit.search(&pattern)?),
            LogCommands::Since { hours } => {
                let end = chrono::Utc::now();
                let start = end - chrono::Duration::hours(i64::from(hours));
                print_records(&audit.in_range(start, end)?);
            }
            LogCommands::Stats => {
                let stats = audit.statistics()?;
                println!("Transfer statistics ({})", audit.path().display());
                println!("  Total records: {}", stats.total);
                println!("  Successful: {}", stats.successful);
                println!("  Failed: {}", stats.failed);
                println!("  Skipped: {}", stats.skipped);
                println!("  Deleted: {}", stats.deleted);
                println!("  Bytes transferred: {}", stats.total_bytes_transferred);
                println!("  Average efficiency: {:.1}%", stats.average_efficiency);
                println!("  Success rate: {:.1}%", stats.success_rate());
            }
            LogCommands::Cleanup { days } => {
                let removed = audit.cleanup(days.unwrap_or(config.log_retention_days))?;
                println!("Removed {removed} old record(s)");
            }
        },
        Commands::Snapshots { command } => {
            let store = snapshot_store(&config);
            match command {
                SnapshotCommands::Stats => {
                    let stats = store.stats();
                    println!("Snapshot statistics ({})", stats.snapshot_dir.display());
                    println!("  Snapshots: {}", stats.total_snapshots);
                    if let Some(oldest) = stats.oldest_snapshot {
                        println!("  Oldest: {}", oldest.format("%Y-%m-%d %H:%M:%S"));
                    }
                    if let Some(newest) = stats.newest_snapshot {
                        println!("  Newest: {}", newest.format("%Y-%m-%d %H:%M:%S"));
                    }
                    println!("  Retention: {} days", stats.retention_days);
                    println!("  Disk usage: {} bytes", stats.disk_usage_bytes);
                }
                SnapshotCommands::Cleanup => {
                    let removed = store.cleanup_expired()?;
                    println!("Removed {removed} expired snapshot(s)");
                }
                SnapshotCommands::Backup => {
                    let path = store.create_timestamped_backup(&store.load())?;
                    println!("Backup written to {}", path.display());
                }
            }
        }
    }

    Ok(())
}
