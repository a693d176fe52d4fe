use filetime::FileTime;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

use crate::error::{IoContext, Result, SyncError};
use crate::model::FileDelta;

/// Write `delta` into `target` and stamp it with the source modification time.
///
/// An absent target is created from the delta alone, so the delta must cover
/// every block. An existing target is patched in place: each block is written at
/// `index * block_size`, then the file is truncated to the source size.
pub fn apply_delta(target: &Path, delta: &FileDelta) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }

    if target.exists() {
        update_existing_file(target, delta)?;
    } else {
        create_new_file(target, delta)?;
    }

    filetime::set_file_mtime(target, FileTime::from_system_time(delta.source_modified()))
        .with_path(target)?;

    debug!(
        target = %target.display(),
        changed = delta.changed_blocks(),
        size = delta.source_size(),
        "applied delta"
    );
    Ok(())
}

fn create_new_file(target: &Path, delta: &FileDelta) -> Result<()> {
    if delta.changed_blocks() != delta.total_blocks() {
        return Err(SyncError::InvalidDelta {
            path: delta.path().to_string(),
            message: format!(
                "target is absent but delta covers only {} of {} blocks",
                delta.changed_blocks(),
                delta.total_blocks()
            ),
        });
    }

    let file = File::create(target).with_path(target)?;
    let mut writer = BufWriter::new(file);
    for block in delta.block_deltas() {
        writer.write_all(block.data()).with_path(target)?;
    }
    let file = writer.into_inner().map_err(|e| SyncError::io(target, e.into_error()))?;
    file.sync_all().with_path(target)?;

    debug!(target = %target.display(), blocks = delta.changed_blocks(), "created new file");
    Ok(())
}

fn update_existing_file(target: &Path, delta: &FileDelta) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .with_path(target)?;

    let block_size = delta.block_size() as u64;
    for block in delta.block_deltas() {
        file.seek(SeekFrom::Start(block.index() * block_size))
            .with_path(target)?;
        file.write_all(block.data()).with_path(target)?;
    }

    // Always truncate, including to zero for files that became empty.
    file.set_len(delta.source_size()).with_path(target)?;
    file.sync_all().with_path(target)?;

    debug!(target = %target.display(), size = delta.source_size(), "updated existing file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaEngine;
    use crate::model::BlockDelta;
    use crate::snapshot::SnapshotEngine;
    use std::fs;
    use std::time::{Duration, SystemTime};

    /// Snapshot `old`, rewrite the source to `new`, diff and apply onto a copy of `old`.
    fn sync_through(old: &[u8], new: &[u8], block_size: usize) -> Vec<u8> {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source.bin");
        let target = temp.path().join("target.bin");

        fs::write(&source, old).unwrap();
        fs::write(&target, old).unwrap();
        let baseline = SnapshotEngine::new(block_size)
            .create_snapshot(&source, "source.bin")
            .unwrap();

        fs::write(&source, new).unwrap();
        let delta = DeltaEngine::new(block_size)
            .calculate_delta(&source, Some(&baseline), "source.bin")
            .unwrap();
        apply_delta(&target, &delta).unwrap();
        fs::read(&target).unwrap()
    }

    #[test]
    fn test_round_trip_modified() {
        let old = b"AAAABBBBCCCCDDDD";
        let new = b"AAAAXXXXCCCCDDDD";
        assert_eq!(sync_through(old, new, 4), new);
    }

    #[test]
    fn test_round_trip_grow() {
        let old = vec![1u8; 5000];
        let mut new = old.clone();
        new.extend_from_slice(&[2u8; 3000]);
        assert_eq!(sync_through(&old, &new, 1024), new);
    }

    #[test]
    fn test_round_trip_shrink_with_unchanged_prefix() {
        let old = b"AAAABBBBCCCC";
        let new = b"AAAAB";
        assert_eq!(sync_through(old, new, 4), new);
    }

    #[test]
    fn test_round_trip_to_empty() {
        assert_eq!(sync_through(b"some bytes", b"", 4), b"");
    }

    #[test]
    fn test_new_file_from_scratch() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src.bin");
        let target = temp.path().join("nested/dir/dst.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &data).unwrap();

        let delta = DeltaEngine::default().calculate_delta(&source, None, "src.bin").unwrap();
        assert!(delta.is_new_file());
        apply_delta(&target, &delta).unwrap();

        assert_eq!(fs::read(&target).unwrap(), data);
        assert_eq!(fs::metadata(&target).unwrap().len(), delta.source_size());
    }

    #[test]
    fn test_empty_delta_creates_empty_file() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("empty.txt");
        let delta = FileDelta::new("empty.txt", 4, vec![], 0, 0, SystemTime::UNIX_EPOCH).unwrap();
        apply_delta(&target, &delta).unwrap();
        assert!(target.exists());
        assert_eq!(fs::metadata(&target).unwrap().len(), 0);
    }

    #[test]
    fn test_partial_delta_on_absent_target_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("partial.txt");
        let delta = FileDelta::new(
            "partial.txt",
            4,
            vec![BlockDelta::new(1, b"BBBB".to_vec())],
            2,
            8,
            SystemTime::UNIX_EPOCH,
        )
        .unwrap();
        let err = apply_delta(&target, &delta).unwrap_err();
        assert!(matches!(err, SyncError::InvalidDelta { .. }));
        assert!(!target.exists());
    }

    #[test]
    fn test_mtime_copied_from_source() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("stamped.txt");
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let delta = FileDelta::new(
            "stamped.txt",
            4,
            vec![BlockDelta::new(0, b"abc".to_vec())],
            1,
            3,
            when,
        )
        .unwrap();
        apply_delta(&target, &delta).unwrap();
        assert_eq!(fs::metadata(&target).unwrap().modified().unwrap(), when);
    }
}
