//! Tree enumeration and change/deletion detection between a source and a target root.
//!
//! The content probe used here is a pre-filter, not the diff mechanism. It only
//! samples the first and last [`PROBE_WINDOW`] bytes of equally sized files, so a
//! large file whose only changes lie strictly inside the unsampled middle region
//! is reported as identical and skipped by incremental runs. Full runs do not use
//! the probe and always re-examine every file.

use rayon::prelude::*;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::util::{self, FileEntry};

/// Bytes sampled at each end of a file by [`are_files_different`].
pub const PROBE_WINDOW: u64 = 1024;

/// Every regular file under `root`. A missing root yields an empty list.
pub fn detect_all_files(root: &Path) -> Result<Vec<FileEntry>> {
    let files = util::walk_files(root)?;
    debug!(root = %root.display(), files = files.len(), "detected files for full transfer");
    Ok(files)
}

/// Source files whose counterpart under `target_root` is absent or fails the probe.
pub fn detect_changed_files(source_root: &Path, target_root: &Path) -> Result<Vec<FileEntry>> {
    let source_files = util::walk_files(source_root)?;
    info!(
        files = source_files.len(),
        source = %source_root.display(),
        target = %target_root.display(),
        "checking source files for changes"
    );

    let changed: Vec<FileEntry> = source_files
        .into_par_iter()
        .filter(|entry| {
            let target = util::resolve(target_root, &entry.relative_path);
            let different = are_files_different(&entry.full_path, &target);
            if different {
                debug!(path = %entry.relative_path, "needs transfer");
            }
            different
        })
        .collect();

    info!(changed = changed.len(), "detected changed files");
    Ok(changed)
}

/// Target files with no counterpart under `source_root`.
pub fn detect_deleted_files(source_root: &Path, target_root: &Path) -> Result<Vec<FileEntry>> {
    let source_paths = util::path_set(&util::walk_files(source_root)?);
    let deleted: Vec<FileEntry> = util::walk_files(target_root)?
        .into_iter()
        .filter(|entry| !source_paths.contains(&entry.relative_path))
        .collect();

    debug!(
        deleted = deleted.len(),
        target = %target_root.display(),
        "detected files absent from source"
    );
    Ok(deleted)
}

/// Fast content probe. Different if either file is missing, sizes differ, or the
/// first/last window differs. Two empty files are identical. Read errors count as
/// different.
pub fn are_files_different(a: &Path, b: &Path) -> bool {
    match probe(a, b) {
        Ok(different) => different,
        Err(e) => {
            warn!(a = %a.display(), b = %b.display(), error = %e, "probe failed, assuming different");
            true
        }
    }
}

fn probe(a: &Path, b: &Path) -> io::Result<bool> {
    let (meta_a, meta_b) = match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => (ma, mb),
        (Err(e), _) | (_, Err(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        (Err(e), _) | (_, Err(e)) => return Err(e),
    };
    if !meta_a.is_file() || !meta_b.is_file() {
        return Ok(true);
    }

    let size = meta_a.len();
    if size != meta_b.len() {
        return Ok(true);
    }
    if size == 0 {
        return Ok(false);
    }

    let mut file_a = File::open(a)?;
    let mut file_b = File::open(b)?;

    let head = PROBE_WINDOW.min(size);
    if read_window(&mut file_a, 0, head)? != read_window(&mut file_b, 0, head)? {
        return Ok(true);
    }

    if size > PROBE_WINDOW {
        let tail_start = size - PROBE_WINDOW;
        if read_window(&mut file_a, tail_start, PROBE_WINDOW)?
            != read_window(&mut file_b, tail_start, PROBE_WINDOW)?
        {
            return Ok(true);
        }
    }

    Ok(false)
}

fn read_window(file: &mut File, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    let n = util::read_block(file, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let full = root.join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, data).unwrap();
    }

    #[test]
    fn test_probe_missing_and_size() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "a", b"1234");
        write(temp.path(), "b", b"12345");
        assert!(are_files_different(&temp.path().join("a"), &temp.path().join("zzz")));
        assert!(are_files_different(&temp.path().join("a"), &temp.path().join("b")));
    }

    #[test]
    fn test_probe_empty_files_identical() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "a", b"");
        write(temp.path(), "b", b"");
        assert!(!are_files_different(&temp.path().join("a"), &temp.path().join("b")));
    }

    #[test]
    fn test_probe_small_file_overlapping_windows() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "a", &[1u8; 1500]);
        let mut changed = vec![1u8; 1500];
        changed[1200] = 2;
        write(temp.path(), "b", &changed);
        assert!(are_files_different(&temp.path().join("a"), &temp.path().join("b")));
    }

    #[test]
    fn test_probe_misses_middle_only_change() {
        // Known limitation: only the first and last windows are sampled.
        let temp = tempfile::tempdir().unwrap();
        let original = vec![0u8; 10_000];
        let mut middle = original.clone();
        middle[5_000] = 0xFF;
        write(temp.path(), "a", &original);
        write(temp.path(), "b", &middle);
        assert!(!are_files_different(&temp.path().join("a"), &temp.path().join("b")));

        let mut tail = original.clone();
        tail[9_999] = 0xFF;
        write(temp.path(), "c", &tail);
        assert!(are_files_different(&temp.path().join("a"), &temp.path().join("c")));
    }

    #[test]
    fn test_detect_changed_and_deleted() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src, "same.txt", b"same");
        write(&dst, "same.txt", b"same");
        write(&src, "new.txt", b"new");
        write(&src, "sub/changed.txt", b"version 2");
        write(&dst, "sub/changed.txt", b"version 1");
        write(&dst, "orphan.txt", b"gone from source");

        let changed: Vec<_> = detect_changed_files(&src, &dst)
            .unwrap()
            .into_iter()
            .map(|e| e.relative_path)
            .collect();
        assert_eq!(changed, vec!["new.txt", "sub/changed.txt"]);

        let deleted: Vec<_> = detect_deleted_files(&src, &dst)
            .unwrap()
            .into_iter()
            .map(|e| e.relative_path)
            .collect();
        assert_eq!(deleted, vec!["orphan.txt"]);
    }

    #[test]
    fn test_detect_all_missing_root() {
        let temp = tempfile::tempdir().unwrap();
        assert!(detect_all_files(&temp.path().join("absent")).unwrap().is_empty());
    }
}
