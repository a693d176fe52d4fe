use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

use crate::error::{IoContext, Result};
use crate::model::{BlockDelta, FileDelta, FileSnapshot, DEFAULT_BLOCK_SIZE};
use crate::util;

/// Fixed-offset block diff against a cached baseline.
///
/// Blocks are compared by ordinal position only:
/// 1. Stream the source in block-sized chunks
/// 2. Hash each chunk and look up the baseline hash at the same index
/// 3. Emit a [`BlockDelta`] on mismatch or when the baseline has no such index
///
/// Content that shifts by an insertion changes every following block; there is
/// no rolling re-alignment.
#[derive(Debug, Clone, Copy)]
pub struct DeltaEngine {
    block_size: usize,
}

impl Default for DeltaEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl DeltaEngine {
    /// # Panics
    /// Panics if `block_size` is zero.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self { block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Diff `source` against `baseline`. With no baseline every block is emitted.
    /// A baseline captured at a different block size is treated as absent.
    pub fn calculate_delta(
        &self,
        source: &Path,
        baseline: Option<&FileSnapshot>,
        relative_path: &str,
    ) -> Result<FileDelta> {
        let baseline = baseline.filter(|b| {
            let usable = b.block_size() == self.block_size;
            if !usable {
                debug!(
                    path = relative_path,
                    cached = b.block_size(),
                    current = self.block_size,
                    "ignoring baseline taken at a different block size"
                );
            }
            usable
        });

        let meta = std::fs::metadata(source).with_path(source)?;
        let source_modified = meta.modified().with_path(source)?;

        let file = File::open(source).with_path(source)?;
        let mut reader = BufReader::with_capacity(self.block_size.max(64 * 1024), file);
        let mut buffer = vec![0u8; self.block_size];
        let mut block_deltas = Vec::new();
        let mut index = 0u64;
        let mut source_size = 0u64;

        loop {
            let n = util::read_block(&mut reader, &mut buffer).with_path(source)?;
            if n == 0 {
                break;
            }
            let block = &buffer[..n];
            let hash = util::hash_bytes(block);

            let unchanged = baseline
                .and_then(|b| b.block_hash(index))
                .is_some_and(|cached| *cached == hash);
            if !unchanged {
                block_deltas.push(BlockDelta::new(index, block.to_vec()));
            }

            index += 1;
            source_size += n as u64;
            if n < self.block_size {
                break;
            }
        }

        let delta = FileDelta::new(
            relative_path,
            self.block_size,
            block_deltas,
            index,
            source_size,
            source_modified,
        )?;

        debug!(
            path = relative_path,
            changed = delta.changed_blocks(),
            total = delta.total_blocks(),
            efficiency = format!("{:.1}", delta.efficiency_percentage()),
            "calculated delta"
        );
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotEngine;
    use std::fs;
    use std::time::SystemTime;

    fn baseline(blocks: &[&[u8]], block_size: usize) -> FileSnapshot {
        let size: usize = blocks.iter().map(|b| b.len()).sum();
        let joined: Vec<u8> = blocks.concat();
        FileSnapshot::new(
            "a.txt",
            size as u64,
            SystemTime::UNIX_EPOCH,
            util::hash_bytes(&joined),
            blocks.iter().map(|b| util::hash_bytes(b)).collect(),
            block_size,
        )
        .unwrap()
    }

    #[test]
    fn test_appended_block_only() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"AAAABBBBCCCC").unwrap();

        let base = baseline(&[b"AAAA".as_slice(), b"BBBB".as_slice()], 4);
        let delta = DeltaEngine::new(4)
            .calculate_delta(&path, Some(&base), "a.txt")
            .unwrap();

        assert_eq!(delta.block_deltas().len(), 1);
        assert_eq!(delta.block_deltas()[0].index(), 2);
        assert_eq!(delta.block_deltas()[0].data(), b"CCCC");
        assert_eq!(delta.total_blocks(), 3);
        assert_eq!(delta.changed_blocks(), 1);
        assert!((delta.efficiency_percentage() - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(delta.source_size(), 12);
    }

    #[test]
    fn test_no_baseline_covers_every_block() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("new.bin");
        fs::write(&path, vec![3u8; 10_000]).unwrap();

        let delta = DeltaEngine::default().calculate_delta(&path, None, "new.bin").unwrap();
        assert_eq!(delta.total_blocks(), 3);
        assert_eq!(delta.changed_blocks(), 3);
        assert!(delta.is_new_file());
        assert_eq!(delta.bytes_transferred(), 10_000);
    }

    #[test]
    fn test_unchanged_file_has_no_deltas() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("same");
        fs::write(&path, b"0123456789").unwrap();

        let snap = SnapshotEngine::new(4).create_snapshot(&path, "same").unwrap();
        let delta = DeltaEngine::new(4).calculate_delta(&path, Some(&snap), "same").unwrap();
        assert!(!delta.has_changes());
        assert_eq!(delta.total_blocks(), 3);
    }

    #[test]
    fn test_middle_block_change() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"AAAAXXXXCCCC").unwrap();

        let base = baseline(&[b"AAAA".as_slice(), b"BBBB".as_slice(), b"CCCC".as_slice()], 4);
        let delta = DeltaEngine::new(4).calculate_delta(&path, Some(&base), "a.txt").unwrap();
        let indices: Vec<u64> = delta.block_deltas().iter().map(|b| b.index()).collect();
        assert_eq!(indices, vec![1]);
    }

    #[test]
    fn test_shrunk_source_has_no_deltas_for_kept_prefix() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"AAAA").unwrap();

        let base = baseline(&[b"AAAA".as_slice(), b"BBBB".as_slice(), b"CCCC".as_slice()], 4);
        let delta = DeltaEngine::new(4).calculate_delta(&path, Some(&base), "a.txt").unwrap();
        assert!(!delta.has_changes());
        assert_eq!(delta.total_blocks(), 1);
        assert_eq!(delta.source_size(), 4);
    }

    #[test]
    fn test_block_size_mismatch_ignores_baseline() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"AAAABBBB").unwrap();

        let base = baseline(&[b"AAAABBBB".as_slice()], 8);
        let delta = DeltaEngine::new(4).calculate_delta(&path, Some(&base), "a.txt").unwrap();
        assert_eq!(delta.changed_blocks(), 2);
    }
}
