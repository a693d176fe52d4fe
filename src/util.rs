use std::collections::BTreeSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::model::Hash;

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub relative_path: String,
    pub full_path: PathBuf,
    /// File size in bytes. Free from the OS directory scan.
    pub size: u64,
}

/// Walk a directory tree and collect every regular file with its relative path.
/// Paths use forward slashes so snapshot keys are identical across platforms.
///
/// A missing root yields an empty list. A root that exists but cannot be read
/// is a run-level failure; unreadable entries below it are skipped with a warning.
pub fn walk_files(root: &Path) -> Result<Vec<FileEntry>> {
    if !root.exists() {
        debug!(root = %root.display(), "root does not exist, nothing to scan");
        return Ok(Vec::new());
    }
    if !root.is_dir() {
        return Err(SyncError::RunLevel {
            message: format!("{} is not a directory", root.display()),
        });
    }

    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(SyncError::RunLevel {
                    message: format!("failed to read {}: {}", root.display(), e),
                });
            }
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let Some(relative_path) = relative_path(root, &full_path) else {
            warn!(path = %full_path.display(), "skipping non-UTF8 path");
            continue;
        };

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %full_path.display(), error = %e, "skipping file without metadata");
                continue;
            }
        };

        entries.push(FileEntry {
            relative_path,
            full_path,
            size,
        });
    }

    debug!(root = %root.display(), files = entries.len(), "scanned tree");
    Ok(entries)
}

/// Relative path of `full` under `root`, with forward slashes.
pub fn relative_path(root: &Path, full: &Path) -> Option<String> {
    let relative = full.strip_prefix(root).ok()?;
    Some(relative.to_str()?.replace('\\', "/"))
}

/// Resolve a forward-slash relative path under `root`.
pub fn resolve(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of input.
/// A plain `read` may return short counts mid-file, which would shift block boundaries.
pub fn read_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Collect just the relative paths as a set for fast lookup.
pub fn path_set(entries: &[FileEntry]) -> BTreeSet<String> {
    entries.iter().map(|e| e.relative_path.clone()).collect()
}

pub fn total_bytes(entries: &[FileEntry]) -> u64 {
    entries.iter().map(|e| e.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_walk_missing_root_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let entries = walk_files(&temp.path().join("nope")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_walk_collects_nested_files_only() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("sub/deeper")).unwrap();
        fs::create_dir_all(temp.path().join("empty_dir")).unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        fs::write(temp.path().join("sub/deeper/b.bin"), b"bbb").unwrap();

        let entries = walk_files(temp.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub/deeper/b.bin"]);
        assert_eq!(total_bytes(&entries), 4);
    }

    #[test]
    fn test_walk_rejects_file_root() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(walk_files(&file), Err(SyncError::RunLevel { .. })));
    }

    #[test]
    fn test_resolve_splits_forward_slashes() {
        let root = Path::new("/base");
        assert_eq!(resolve(root, "a/b/c.txt"), root.join("a").join("b").join("c.txt"));
    }

    #[test]
    fn test_read_block_fills_across_short_reads() {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }

        let mut reader = Trickle(b"ABCDEFG");
        let mut buf = [0u8; 4];
        assert_eq!(read_block(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ABCD");
        assert_eq!(read_block(&mut reader, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"EFG");
        assert_eq!(read_block(&mut reader, &mut buf).unwrap(), 0);
    }
}
