//! Block-level incremental synchronization between two directory trees.
//!
//! Files are fingerprinted into fixed-size BLAKE3 block hashes. A run compares
//! each candidate file against its cached baseline and writes only the blocks
//! that changed into the target tree.

pub mod apply;
pub mod audit;
pub mod config;
pub mod delta;
pub mod detect;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod snapshot;
pub mod store;
pub mod util;

pub use audit::{AuditRecord, AuditSink, AuditStatus, JsonlAuditLog, MemoryAuditLog};
pub use config::Config;
pub use error::{Result, SyncError};
pub use model::{BlockDelta, Direction, FileDelta, FileSnapshot, Mode, TransferOperation};
pub use orchestrator::{FileOutcome, SyncOrchestrator, TransferReport, TransferRun};
pub use progress::{LogProgress, ProgressEvent, ProgressSink};
pub use store::SnapshotStore;
