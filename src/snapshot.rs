use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

use crate::error::{IoContext, Result};
use crate::model::{FileSnapshot, DEFAULT_BLOCK_SIZE};
use crate::util;

/// Fingerprints files into per-block and whole-file BLAKE3 digests.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotEngine {
    block_size: usize,
}

impl Default for SnapshotEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl SnapshotEngine {
    /// # Panics
    /// Panics if `block_size` is zero. Config validation rejects zero before this point.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self { block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Stream `path` once in block-sized chunks. Each chunk is hashed on its own
    /// and also fed into one running whole-file digest.
    pub fn create_snapshot(&self, path: &Path, relative_path: &str) -> Result<FileSnapshot> {
        let meta = std::fs::metadata(path).with_path(path)?;
        let modified = meta.modified().with_path(path)?;

        let file = File::open(path).with_path(path)?;
        let mut reader = BufReader::with_capacity(self.block_size.max(64 * 1024), file);
        let mut buffer = vec![0u8; self.block_size];
        let mut file_hasher = blake3::Hasher::new();
        let mut block_hashes = Vec::new();
        let mut size = 0u64;

        loop {
            let n = util::read_block(&mut reader, &mut buffer).with_path(path)?;
            if n == 0 {
                break;
            }
            let block = &buffer[..n];
            block_hashes.push(util::hash_bytes(block));
            file_hasher.update(block);
            size += n as u64;
            if n < self.block_size {
                break;
            }
        }

        if size != meta.len() {
            debug!(
                path = relative_path,
                expected = meta.len(),
                read = size,
                "file changed size while being snapshotted"
            );
        }

        let snapshot = FileSnapshot::new(
            relative_path,
            size,
            modified,
            *file_hasher.finalize().as_bytes(),
            block_hashes,
            self.block_size,
        )?;

        debug!(
            path = relative_path,
            blocks = snapshot.block_hashes().len(),
            bytes = size,
            "created snapshot"
        );
        Ok(snapshot)
    }

    /// True if the cached baseline is absent or the file changed since.
    pub fn needs_transfer(&self, new: &FileSnapshot, old: Option<&FileSnapshot>) -> bool {
        match old {
            None => {
                debug!(path = new.path(), "needs transfer: no previous snapshot");
                true
            }
            Some(old) => {
                let changed = new.has_changed_from(old);
                if changed {
                    debug!(path = new.path(), "needs transfer: file has changed");
                }
                changed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_snapshot_block_hashes() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"AAAABBBBCC").unwrap();

        let snap = SnapshotEngine::new(4).create_snapshot(&path, "a.txt").unwrap();
        assert_eq!(snap.size(), 10);
        assert_eq!(
            snap.block_hashes(),
            &[
                util::hash_bytes(b"AAAA"),
                util::hash_bytes(b"BBBB"),
                util::hash_bytes(b"CC")
            ]
        );
        assert_eq!(snap.file_hash(), &util::hash_bytes(b"AAAABBBBCC"));
        assert_eq!(snap.block_size(), 4);
    }

    #[test]
    fn test_snapshot_empty_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("empty");
        fs::write(&path, b"").unwrap();

        let snap = SnapshotEngine::new(4).create_snapshot(&path, "empty").unwrap();
        assert_eq!(snap.size(), 0);
        assert!(snap.block_hashes().is_empty());
        assert_eq!(snap.file_hash(), &util::hash_bytes(b""));
    }

    #[test]
    fn test_snapshot_exact_multiple_of_block_size() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("exact");
        fs::write(&path, vec![7u8; 8192]).unwrap();

        let snap = SnapshotEngine::default().create_snapshot(&path, "exact").unwrap();
        assert_eq!(snap.block_hashes().len(), 2);
    }

    #[test]
    fn test_snapshot_missing_file_is_io_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = SnapshotEngine::default()
            .create_snapshot(&temp.path().join("missing"), "missing")
            .unwrap_err();
        assert!(err.is_per_file());
    }

    #[test]
    fn test_needs_transfer() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"content").unwrap();
        let engine = SnapshotEngine::new(4);

        let first = engine.create_snapshot(&path, "f").unwrap();
        assert!(engine.needs_transfer(&first, None));

        let again = engine.create_snapshot(&path, "f").unwrap();
        assert!(!engine.needs_transfer(&again, Some(&first)));

        fs::write(&path, b"content plus more").unwrap();
        let grown = engine.create_snapshot(&path, "f").unwrap();
        assert!(engine.needs_transfer(&grown, Some(&first)));
    }
}
