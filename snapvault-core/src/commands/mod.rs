//! Command implementations: backup, verify, purge, distill, clone.

use std::path::PathBuf;

use crate::error::{Result, VaultError};
use crate::fsutil;
use crate::repository::Repository;
use crate::snapshot::Snapshot;

pub mod backup;
pub mod clone;
pub mod distill;
pub mod purge;
pub mod verify;

/// Expand verify's path argument: a single path that is not itself a
/// snapshot is treated as a repository and expanded to all its snapshots;
/// otherwise the paths are validated as an explicit snapshot list.
pub(crate) fn resolve_repository_or_snapshots(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if paths.len() == 1 && !Snapshot::is_snapshot_dir(&paths[0]) {
        Repository::snapshot_paths(&paths[0])
    } else {
        validated_snapshot_paths(paths)
    }
}

/// Validate an explicit snapshot-path list: every path must be a snapshot
/// and no two may name the same directory.
pub(crate) fn validated_snapshot_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if paths.is_empty() {
        return Err(VaultError::Config("no snapshot paths specified".to_string()));
    }
    Repository::validate_snapshot_paths(paths)?;
    Ok(paths.iter().map(|p| fsutil::absolutize(p)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_expands_repository() {
        let dir = tempfile::tempdir().unwrap();
        Snapshot::open(&dir.path().join("2024-01-01_00-00-00"), true)
            .unwrap()
            .close()
            .unwrap();
        Snapshot::open(&dir.path().join("2024-02-01_00-00-00"), true)
            .unwrap()
            .close()
            .unwrap();

        let resolved = resolve_repository_or_snapshots(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved[0] < resolved[1]);
    }

    #[test]
    fn test_resolve_passes_snapshot_list_through() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("2024-01-01_00-00-00");
        let b = dir.path().join("2024-02-01_00-00-00");
        Snapshot::open(&a, true).unwrap().close().unwrap();
        Snapshot::open(&b, true).unwrap().close().unwrap();

        let resolved = resolve_repository_or_snapshots(&[a, b]).unwrap();
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_validated_rejects_empty() {
        assert!(validated_snapshot_paths(&[]).is_err());
    }

    #[test]
    fn test_validated_rejects_repository_path() {
        let dir = tempfile::tempdir().unwrap();
        Snapshot::open(&dir.path().join("2024-01-01_00-00-00"), true)
            .unwrap()
            .close()
            .unwrap();

        // A bare repository directory is not a snapshot.
        assert!(matches!(
            validated_snapshot_paths(&[dir.path().to_path_buf()]),
            Err(VaultError::SnapshotInvalid { .. })
        ));
    }
}
