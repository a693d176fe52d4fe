use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::error::{Result, SyncError};
use crate::util;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// BLAKE3 digest, 32 raw bytes.
pub type Hash = [u8; 32];

/// Number of blocks a file of `size` bytes occupies.
pub fn block_count(size: u64, block_size: usize) -> u64 {
    size.div_ceil(block_size as u64)
}

/// Fingerprint of one file: metadata, whole-file digest and per-block digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    path: String,
    size: u64,
    modified: SystemTime,
    file_hash: Hash,
    block_hashes: Vec<Hash>,
    block_size: usize,
    snapshot_time: SystemTime,
}

impl FileSnapshot {
    pub fn new(
        path: impl Into<String>,
        size: u64,
        modified: SystemTime,
        file_hash: Hash,
        block_hashes: Vec<Hash>,
        block_size: usize,
    ) -> Result<Self> {
        let snapshot = Self {
            path: path.into(),
            size,
            modified,
            file_hash,
            block_hashes,
            block_size,
            snapshot_time: SystemTime::now(),
        };
        if !snapshot.is_consistent() {
            return Err(SyncError::validation(
                "snapshot",
                format!(
                    "{}: {} block hashes for {} bytes at block size {}",
                    snapshot.path,
                    snapshot.block_hashes.len(),
                    size,
                    block_size
                ),
            ));
        }
        Ok(snapshot)
    }

    /// Override the capture time. Used when restoring or ageing snapshots.
    pub fn with_snapshot_time(mut self, at: SystemTime) -> Self {
        self.snapshot_time = at;
        self
    }

    /// `len(block_hashes) == ceil(size / block_size)`. Deserialized snapshots
    /// are checked with this before they are trusted as baselines.
    pub fn is_consistent(&self) -> bool {
        self.block_size > 0
            && self.block_hashes.len() as u64 == block_count(self.size, self.block_size)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn file_hash(&self) -> &Hash {
        &self.file_hash
    }

    pub fn block_hashes(&self) -> &[Hash] {
        &self.block_hashes
    }

    pub fn block_hash(&self, index: u64) -> Option<&Hash> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.block_hashes.get(i))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn snapshot_time(&self) -> SystemTime {
        self.snapshot_time
    }

    /// Size and mtime first, whole-file hash last.
    pub fn has_changed_from(&self, other: &FileSnapshot) -> bool {
        if self.size != other.size || self.modified != other.modified {
            return true;
        }
        self.file_hash != other.file_hash
    }

    pub fn is_older_than(&self, max_age: Duration, now: SystemTime) -> bool {
        match now.checked_sub(max_age) {
            Some(cutoff) => self.snapshot_time < cutoff,
            None => false,
        }
    }
}

/// One changed (or new) block of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDelta {
    index: u64,
    data: Vec<u8>,
    hash: Hash,
}

impl BlockDelta {
    pub fn new(index: u64, data: Vec<u8>) -> Self {
        let hash = util::hash_bytes(&data);
        Self { index, data, hash }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }
}

/// Every block of a source file that differs from its baseline.
#[derive(Debug, Clone)]
pub struct FileDelta {
    path: String,
    block_size: usize,
    block_deltas: Vec<BlockDelta>,
    total_blocks: u64,
    source_size: u64,
    source_modified: SystemTime,
}

impl FileDelta {
    /// Validates ordering and sizes: indices strictly ascending and below
    /// `total_blocks`, every block at most `block_size` bytes, and
    /// `total_blocks == ceil(source_size / block_size)`.
    pub fn new(
        path: impl Into<String>,
        block_size: usize,
        block_deltas: Vec<BlockDelta>,
        total_blocks: u64,
        source_size: u64,
        source_modified: SystemTime,
    ) -> Result<Self> {
        let path = path.into();
        let invalid = |message: String| SyncError::InvalidDelta {
            path: path.clone(),
            message,
        };

        if block_size == 0 {
            return Err(invalid("block size is zero".into()));
        }
        if total_blocks != block_count(source_size, block_size) {
            return Err(invalid(format!(
                "{total_blocks} blocks for {source_size} bytes at block size {block_size}"
            )));
        }
        let mut previous: Option<u64> = None;
        for block in &block_deltas {
            if previous.is_some_and(|p| block.index <= p) {
                return Err(invalid(format!("block {} out of order", block.index)));
            }
            if block.index >= total_blocks {
                return Err(invalid(format!(
                    "block {} beyond {} total blocks",
                    block.index, total_blocks
                )));
            }
            if block.data.len() > block_size {
                return Err(invalid(format!(
                    "block {} holds {} bytes, block size is {}",
                    block.index,
                    block.data.len(),
                    block_size
                )));
            }
            previous = Some(block.index);
        }

        Ok(Self {
            path,
            block_size,
            block_deltas,
            total_blocks,
            source_size,
            source_modified,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_deltas(&self) -> &[BlockDelta] {
        &self.block_deltas
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn changed_blocks(&self) -> u64 {
        self.block_deltas.len() as u64
    }

    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    pub fn source_modified(&self) -> SystemTime {
        self.source_modified
    }

    pub fn has_changes(&self) -> bool {
        !self.block_deltas.is_empty()
    }

    pub fn is_new_file(&self) -> bool {
        self.total_blocks == self.changed_blocks() && self.has_changes()
    }

    /// Share of blocks that had to be shipped, 0.0 for empty files.
    pub fn efficiency_percentage(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.changed_blocks() as f64 / self.total_blocks as f64 * 100.0
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.block_deltas.iter().map(|b| b.data.len() as u64).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    DcToDr,
    DrToDc,
}

impl FromStr for Direction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DC_TO_DR" | "DC-TO-DR" | "BACKUP" => Ok(Direction::DcToDr),
            "DR_TO_DC" | "DR-TO-DC" | "RECOVERY" | "RESTORE" => Ok(Direction::DrToDc),
            _ => Err(SyncError::validation("direction", s)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::DcToDr => f.write_str("DC_TO_DR"),
            Direction::DrToDc => f.write_str("DR_TO_DC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Incremental,
    Full,
}

impl Mode {
    /// Absent or blank tokens select the incremental default.
    pub fn parse(token: Option<&str>) -> Result<Self> {
        match token.map(str::trim) {
            None | Some("") => Ok(Mode::Incremental),
            Some(s) => s.parse(),
        }
    }
}

impl FromStr for Mode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Mode::Full),
            "incremental" | "inc" => Ok(Mode::Incremental),
            _ => Err(SyncError::validation("mode", s)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Incremental => f.write_str("INCREMENTAL"),
            Mode::Full => f.write_str("FULL"),
        }
    }
}

/// Parameters of one run, fixed once the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOperation {
    direction: Direction,
    mode: Mode,
    source_root: PathBuf,
    target_root: PathBuf,
}

impl TransferOperation {
    /// Resolves source and target from the DC/DR roots according to `direction`.
    pub fn new(direction: Direction, mode: Mode, dc_root: &Path, dr_root: &Path) -> Self {
        let (source_root, target_root) = match direction {
            Direction::DcToDr => (dc_root.to_path_buf(), dr_root.to_path_buf()),
            Direction::DrToDc => (dr_root.to_path_buf(), dc_root.to_path_buf()),
        };
        Self {
            direction,
            mode,
            source_root,
            target_root,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_full(&self) -> bool {
        self.mode == Mode::Full
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    pub fn description(&self) -> String {
        let mode = match self.mode {
            Mode::Full => "Full",
            Mode::Incremental => "Incremental",
        };
        let direction = match self.direction {
            Direction::DcToDr => "backup (DC → DR)",
            Direction::DrToDc => "recovery (DR → DC)",
        };
        format!("{mode} {direction}")
    }
}
