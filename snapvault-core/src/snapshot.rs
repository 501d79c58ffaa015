//! A single snapshot: one timestamped directory inside a repository.
//!
//! The snapshot owns its directory, the `.backup` metadata directory with
//! the index, and the `IN_PROGRESS` marker. While the marker exists the
//! snapshot is open for writes; once cleared it is immutable except through
//! the maintenance commands.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};
use crate::fsutil;
use crate::index::SnapshotIndex;
use crate::repo_file::RepoFile;
use crate::stats::Stats;

/// Metadata directory inside every snapshot.
pub const METADATA_DIR_NAME: &str = ".backup";
/// Index file inside the metadata directory.
pub const INDEX_FILE_NAME: &str = "db.sqlite";
/// Marker present while the snapshot is incomplete.
pub const IN_PROGRESS_FILE_NAME: &str = "IN_PROGRESS";

/// An open snapshot directory with its index.
pub struct Snapshot {
    path: PathBuf,
    index: SnapshotIndex,
}

impl Snapshot {
    /// Whether `path` looks like a snapshot (its index file exists).
    pub fn is_snapshot_dir(path: &Path) -> bool {
        path.join(METADATA_DIR_NAME).join(INDEX_FILE_NAME).exists()
    }

    /// Validate that `path` is an openable snapshot: the index file must
    /// exist and no `IN_PROGRESS` marker may be present.
    pub fn validate(path: &Path) -> Result<()> {
        let path = fsutil::absolutize(path);
        if !Self::is_snapshot_dir(&path) {
            return Err(VaultError::SnapshotInvalid {
                path: path.clone(),
                reason: format!(
                    "index file missing: {}",
                    path.join(METADATA_DIR_NAME).join(INDEX_FILE_NAME).display()
                ),
            });
        }
        if path.join(METADATA_DIR_NAME).join(IN_PROGRESS_FILE_NAME).exists() {
            return Err(VaultError::SnapshotInProgress { path });
        }
        Ok(())
    }

    /// Open an existing snapshot, or create a fresh one.
    ///
    /// Opening an existing snapshot validates it, takes a timestamped backup
    /// of the index, and makes the live index writable. Creating requires
    /// the directory to not exist yet.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        // Normalized path, so path length limits behave the same everywhere.
        let path = fsutil::absolutize(path);
        fsutil::check_path_length(&path);

        let index_path = path.join(METADATA_DIR_NAME).join(INDEX_FILE_NAME);

        if create {
            if path.exists() {
                return Err(VaultError::SnapshotExists { path });
            }
            fs::create_dir_all(path.join(METADATA_DIR_NAME))?;
        } else {
            Self::validate(&path)?;
            fsutil::make_backup(&index_path)?;
            fsutil::make_writable(&index_path);
        }

        let index = SnapshotIndex::open(&index_path)?;
        Ok(Snapshot { path, index })
    }

    /// Close the index, make it read-only, and re-take its backup.
    pub fn close(self) -> Result<()> {
        let index_path = self.index.path().to_path_buf();
        self.index.close()?;
        fsutil::make_readonly(&index_path);
        fsutil::make_backup(&index_path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot's directory name (its timestamp plus optional suffix).
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_DIR_NAME)
    }

    fn in_progress_path(&self) -> PathBuf {
        self.metadata_path().join(IN_PROGRESS_FILE_NAME)
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress_path().exists()
    }

    pub fn set_in_progress(&self) -> Result<()> {
        File::create(self.in_progress_path())?;
        Ok(())
    }

    pub fn clear_in_progress(&self) -> Result<()> {
        fs::remove_file(self.in_progress_path())?;
        Ok(())
    }

    /// First row matching the constraints; with `prefer_linkable`, the first
    /// linkable row, falling back to the last seen row so the caller may
    /// still copy from it.
    pub fn find_file(
        &self,
        constraints: &RepoFile,
        prefer_linkable: bool,
    ) -> Result<Option<RepoFile>> {
        self.index.find_file(constraints, &self.path, prefer_linkable)
    }

    /// All rows matching the constraints.
    pub fn find_all(&self, constraints: &RepoFile) -> Result<Vec<RepoFile>> {
        self.index.find_all(constraints, &self.path)
    }

    /// Realize `target` from `from` (link or copy per `prefer_link`) and
    /// insert its index row.
    ///
    /// Returns `Ok(false)` on a filesystem failure — the caller decides how
    /// to proceed; a failed link is *not* retried as a copy here. Index
    /// errors and violated preconditions are fatal.
    pub fn insert_file(
        &self,
        from: &Path,
        target: &RepoFile,
        prefer_link: bool,
        stats: &Stats,
    ) -> Result<bool> {
        if target.parent_path != self.path {
            return Err(VaultError::Invariant(format!(
                "insert into foreign snapshot: {} vs {}",
                target.parent_path.display(),
                self.path.display()
            )));
        }

        let realized = if prefer_link {
            target.link_from(from, stats)
        } else {
            target.copy_from(from, stats)
        };
        if !realized {
            return Ok(false);
        }

        self.index.insert(target)?;
        Ok(true)
    }

    /// Delete the archive file, then its index row.
    pub fn delete_file(&self, file: &RepoFile, stats: &Stats) -> Result<bool> {
        if !file.delete(stats) {
            return Ok(false);
        }
        self.index.delete(file)?;
        Ok(true)
    }

    /// Drop index rows without touching the filesystem (purge).
    pub fn remove_index_rows(&self, constraints: &RepoFile) -> Result<usize> {
        self.index.delete(constraints)
    }

    pub fn check_integrity(&self) -> Result<bool> {
        self.index.check_integrity()
    }

    pub fn compact(&self) -> Result<()> {
        self.index.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Timestamp;

    fn create_snapshot(repo: &Path, name: &str) -> Snapshot {
        Snapshot::open(&repo.join(name), true).unwrap()
    }

    fn sample_target(snapshot: &Snapshot, source: &Path, rel: &str) -> RepoFile {
        RepoFile {
            source_path: source.to_path_buf(),
            size: Some(fs::metadata(source).unwrap().len()),
            time: Some(Timestamp::now()),
            hash: "aa".repeat(32),
            relative_path: PathBuf::from(rel),
            parent_path: snapshot.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = create_snapshot(dir.path(), "2024-01-01_00-00-00");
        let path = snapshot.path().to_path_buf();
        assert!(path.join(METADATA_DIR_NAME).join(INDEX_FILE_NAME).exists());
        snapshot.close().unwrap();

        // Index is read-only between sessions and backed up on reopen.
        let index_path = path.join(METADATA_DIR_NAME).join(INDEX_FILE_NAME);
        assert!(fs::metadata(&index_path).unwrap().permissions().readonly());

        let reopened = Snapshot::open(&path, false).unwrap();
        let backups = fs::read_dir(reopened.metadata_path())
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with("db_") && name.ends_with(".sqlite")
            })
            .count();
        assert_eq!(backups, 1);
        reopened.close().unwrap();
    }

    #[test]
    fn test_create_rejects_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01-01_00-00-00");
        fs::create_dir_all(&path).unwrap();
        match Snapshot::open(&path, false) {
            Err(VaultError::SnapshotInvalid { .. }) => {}
            other => panic!("expected invalid snapshot, got {:?}", other.is_ok()),
        }
        match Snapshot::open(&path, true) {
            Err(VaultError::SnapshotExists { .. }) => {}
            other => panic!("expected existing snapshot error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_in_progress_blocks_open() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = create_snapshot(dir.path(), "2024-01-01_00-00-00");
        let path = snapshot.path().to_path_buf();
        snapshot.set_in_progress().unwrap();
        assert!(snapshot.is_in_progress());
        snapshot.close().unwrap();

        match Snapshot::open(&path, false) {
            Err(VaultError::SnapshotInProgress { .. }) => {}
            other => panic!("expected in-progress error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_insert_file_copies_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        fs::write(&source, b"payload").unwrap();

        let snapshot = create_snapshot(dir.path(), "2024-01-01_00-00-00");
        let target = sample_target(&snapshot, &source, "#data/src.txt");
        let stats = Stats::new();

        assert!(snapshot
            .insert_file(&source, &target, false, &stats)
            .unwrap());
        assert!(target.is_existing());

        let rows = snapshot.find_all(&RepoFile::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].full_path(), target.full_path());
        snapshot.close().unwrap();
    }

    #[test]
    fn test_insert_file_rejects_foreign_parent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        fs::write(&source, b"payload").unwrap();

        let snapshot = create_snapshot(dir.path(), "2024-01-01_00-00-00");
        let mut target = sample_target(&snapshot, &source, "#data/src.txt");
        target.parent_path = dir.path().join("elsewhere");
        let stats = Stats::new();

        match snapshot.insert_file(&source, &target, false, &stats) {
            Err(VaultError::Invariant(_)) => {}
            other => panic!("expected invariant error, got {:?}", other),
        }
        snapshot.close().unwrap();
    }

    #[test]
    fn test_insert_file_missing_source_is_nonfatal() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = create_snapshot(dir.path(), "2024-01-01_00-00-00");
        let missing = dir.path().join("missing.txt");
        let target = RepoFile {
            source_path: missing.clone(),
            size: Some(1),
            time: Some(Timestamp::now()),
            hash: "aa".repeat(32),
            relative_path: PathBuf::from("missing.txt"),
            parent_path: snapshot.path().to_path_buf(),
            ..Default::default()
        };
        let stats = Stats::new();

        assert!(!snapshot
            .insert_file(&missing, &target, false, &stats)
            .unwrap());
        assert!(snapshot.find_all(&RepoFile::default()).unwrap().is_empty());
        snapshot.close().unwrap();
    }

    #[test]
    fn test_delete_file_removes_row_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        fs::write(&source, b"payload").unwrap();

        let snapshot = create_snapshot(dir.path(), "2024-01-01_00-00-00");
        let target = sample_target(&snapshot, &source, "#data/src.txt");
        let stats = Stats::new();
        snapshot.insert_file(&source, &target, false, &stats).unwrap();

        assert!(snapshot.delete_file(&target, &stats).unwrap());
        assert!(!target.is_existing());
        assert!(snapshot.find_all(&RepoFile::default()).unwrap().is_empty());
        snapshot.close().unwrap();
    }
}
