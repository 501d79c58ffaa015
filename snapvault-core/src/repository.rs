//! A repository: an ordered set of snapshots in one directory.
//!
//! Snapshots are discovered by enumerating immediate subdirectories whose
//! name starts with a parseable timestamp; the list is kept sorted by name
//! ascending, which equals chronological order. Repository-wide lookups
//! consult snapshots newest-first: newer snapshots are more likely still
//! below the link-count ceiling.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};
use crate::fsutil;
use crate::repo_file::RepoFile;
use crate::snapshot::Snapshot;

/// An open repository with all its snapshots attached.
pub struct Repository {
    path: PathBuf,
    snapshots: Vec<Snapshot>,
}

impl Repository {
    /// Open a repository, creating its directory first when `create` is set.
    /// All discovered snapshots are validated and opened.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let path = fsutil::absolutize(path);

        if create && !path.exists() {
            fs::create_dir_all(&path)?;
            log::info!("creating repository: {}", path.display());
        }

        let mut snapshots = Vec::new();
        for snapshot_path in Self::snapshot_paths(&path)? {
            snapshots.push(Snapshot::open(&snapshot_path, false)?);
        }

        Ok(Repository { path, snapshots })
    }

    /// Enumerate the snapshot directories of a repository, sorted by name
    /// ascending. Subdirectories whose name does not parse as a timestamp
    /// are skipped; timestamp-named directories must validate.
    pub fn snapshot_paths(repository_path: &Path) -> Result<Vec<PathBuf>> {
        let repository_path = fsutil::absolutize(repository_path);
        if !repository_path.is_dir() {
            return Err(VaultError::RepositoryInvalid {
                path: repository_path,
            });
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&repository_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if fsutil::parse_timestamp_prefix(&name.to_string_lossy()).is_none() {
                continue;
            }
            Snapshot::validate(&entry.path())?;
            paths.push(entry.path());
        }

        paths.sort();
        Ok(paths)
    }

    /// Resolve the repository containing the given snapshot paths. All
    /// snapshots must share one parent directory.
    pub fn parent_repository(snapshot_paths: &[PathBuf]) -> Result<Repository> {
        let mut parent: Option<PathBuf> = None;
        for snapshot_path in snapshot_paths {
            let snapshot_parent = fsutil::absolutize(snapshot_path)
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| VaultError::SnapshotInvalid {
                    path: snapshot_path.clone(),
                    reason: "cannot resolve parent directory".to_string(),
                })?;
            match parent {
                None => parent = Some(snapshot_parent),
                Some(ref first) if *first != snapshot_parent => {
                    return Err(VaultError::MixedRepositories {
                        first: first.clone(),
                        second: snapshot_parent,
                    });
                }
                Some(_) => {}
            }
        }

        let parent = parent.ok_or_else(|| {
            VaultError::Invariant("parent repository of empty snapshot list".to_string())
        })?;
        Repository::open(&parent, false)
    }

    /// Validate a user-supplied list of snapshot paths: each must be a
    /// valid snapshot and no two may name the same directory.
    pub fn validate_snapshot_paths(snapshot_paths: &[PathBuf]) -> Result<()> {
        for (i, snapshot_path) in snapshot_paths.iter().enumerate() {
            Snapshot::validate(snapshot_path)?;
            let canonical = fsutil::absolutize(snapshot_path);
            for other in &snapshot_paths[i + 1..] {
                if canonical == fsutil::absolutize(other) {
                    return Err(VaultError::DuplicateSnapshot {
                        path: canonical.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All attached snapshots, ordered oldest-first.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Attach a snapshot created inside this repository. The snapshot must
    /// live directly under the repository path and not already be attached.
    pub fn attach_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let snapshot_parent = snapshot
            .path()
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| VaultError::SnapshotInvalid {
                path: snapshot.path().to_path_buf(),
                reason: "cannot resolve parent directory".to_string(),
            })?;
        if snapshot_parent != self.path {
            return Err(VaultError::MixedRepositories {
                first: self.path.clone(),
                second: snapshot_parent,
            });
        }
        if self.snapshots.iter().any(|s| s.path() == snapshot.path()) {
            return Err(VaultError::DuplicateSnapshot {
                path: snapshot.path().to_path_buf(),
            });
        }
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// Detach and return the snapshot at `path`.
    pub fn detach_snapshot(&mut self, path: &Path) -> Result<Snapshot> {
        let path = fsutil::absolutize(path);
        match self.snapshots.iter().position(|s| s.path() == path) {
            Some(index) => Ok(self.snapshots.remove(index)),
            None => Err(VaultError::SnapshotNotAttached { path }),
        }
    }

    /// Repository-wide lookup, newest snapshot first.
    ///
    /// With `prefer_linkable`, the first linkable match anywhere wins; if
    /// only unlinkable matches exist, the last one seen is returned so the
    /// caller may copy from it.
    pub fn find_file(
        &self,
        constraints: &RepoFile,
        prefer_linkable: bool,
    ) -> Result<Option<RepoFile>> {
        let mut fallback = None;
        for snapshot in self.snapshots.iter().rev() {
            let Some(file) = snapshot.find_file(constraints, prefer_linkable)? else {
                continue;
            };
            if !prefer_linkable || file.is_linkable() {
                return Ok(Some(file));
            }
            fallback = Some(file);
        }
        Ok(fallback)
    }

    /// All matching rows across all snapshots, newest snapshot first.
    pub fn find_all(&self, constraints: &RepoFile) -> Result<Vec<RepoFile>> {
        let mut files = Vec::new();
        for snapshot in self.snapshots.iter().rev() {
            files.extend(snapshot.find_all(constraints)?);
        }
        Ok(files)
    }

    /// Close every attached snapshot, restoring the read-only index
    /// discipline.
    pub fn close(self) -> Result<()> {
        for snapshot in self.snapshots {
            snapshot.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use crate::units::Timestamp;

    fn make_snapshot(repo: &Path, name: &str) -> Snapshot {
        Snapshot::open(&repo.join(name), true).unwrap()
    }

    fn insert_sample(snapshot: &Snapshot, source: &str, hash: &str, content: &[u8]) {
        let source_file = snapshot.path().parent().unwrap().join("staging.txt");
        fs::write(&source_file, content).unwrap();
        let target = RepoFile {
            source_path: PathBuf::from(source),
            size: Some(content.len() as u64),
            time: Some(Timestamp::from_nanos(1_000)),
            hash: hash.to_string(),
            relative_path: PathBuf::from(source.replace('/', "#")),
            parent_path: snapshot.path().to_path_buf(),
            ..Default::default()
        };
        let stats = Stats::new();
        assert!(snapshot
            .insert_file(&source_file, &target, false, &stats)
            .unwrap());
        fs::remove_file(source_file).unwrap();
    }

    #[test]
    fn test_discovery_orders_and_skips_foreign_dirs() {
        let dir = tempfile::tempdir().unwrap();
        make_snapshot(dir.path(), "2024-02-01_00-00-00").close().unwrap();
        make_snapshot(dir.path(), "2024-01-01_00-00-00").close().unwrap();
        fs::create_dir(dir.path().join("not-a-snapshot")).unwrap();

        let repo = Repository::open(dir.path(), false).unwrap();
        let names: Vec<String> = repo.snapshots().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["2024-01-01_00-00-00", "2024-02-01_00-00-00"]);
        repo.close().unwrap();
    }

    #[test]
    fn test_discovery_rejects_broken_timestamp_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("2024-01-01_00-00-00")).unwrap();
        assert!(Repository::open(dir.path(), false).is_err());
    }

    #[test]
    fn test_open_create_makes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().join("fresh-repo");
        let repo = Repository::open(&repo_path, true).unwrap();
        assert!(repo_path.is_dir());
        assert!(repo.snapshots().is_empty());
        repo.close().unwrap();
    }

    #[test]
    fn test_attach_rejects_foreign_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let mut repo = Repository::open(dir.path(), true).unwrap();

        let foreign = make_snapshot(other.path(), "2024-01-01_00-00-00");
        assert!(matches!(
            repo.attach_snapshot(foreign),
            Err(VaultError::MixedRepositories { .. })
        ));

        let own = make_snapshot(dir.path(), "2024-01-01_00-00-00");
        let own_path = own.path().to_path_buf();
        repo.attach_snapshot(own).unwrap();

        let duplicate = Snapshot::open(&own_path, false);
        // The exclusive index lock may already reject the second open; if it
        // does not, attach must.
        if let Ok(duplicate) = duplicate {
            assert!(matches!(
                repo.attach_snapshot(duplicate),
                Err(VaultError::DuplicateSnapshot { .. })
            ));
        }
        repo.close().unwrap();
    }

    #[test]
    fn test_detach_returns_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        make_snapshot(dir.path(), "2024-01-01_00-00-00").close().unwrap();
        let mut repo = Repository::open(dir.path(), false).unwrap();

        let detached = repo
            .detach_snapshot(&dir.path().join("2024-01-01_00-00-00"))
            .unwrap();
        assert!(repo.snapshots().is_empty());
        assert!(matches!(
            repo.detach_snapshot(detached.path()),
            Err(VaultError::SnapshotNotAttached { .. })
        ));
        detached.close().unwrap();
        repo.close().unwrap();
    }

    #[test]
    fn test_find_file_prefers_newest() {
        let dir = tempfile::tempdir().unwrap();
        let older = make_snapshot(dir.path(), "2024-01-01_00-00-00");
        insert_sample(&older, "/data/a.txt", &"11".repeat(32), b"old content");
        older.close().unwrap();
        let newer = make_snapshot(dir.path(), "2024-02-01_00-00-00");
        insert_sample(&newer, "/data/a.txt", &"11".repeat(32), b"old content");
        newer.close().unwrap();

        let repo = Repository::open(dir.path(), false).unwrap();
        let found = repo
            .find_file(&RepoFile::with_hash(&"11".repeat(32)), false)
            .unwrap()
            .expect("hash should be found");
        assert!(found
            .parent_path
            .ends_with("2024-02-01_00-00-00"));
        repo.close().unwrap();
    }

    #[test]
    fn test_find_all_spans_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let first = make_snapshot(dir.path(), "2024-01-01_00-00-00");
        insert_sample(&first, "/data/a.txt", &"11".repeat(32), b"content");
        first.close().unwrap();
        let second = make_snapshot(dir.path(), "2024-02-01_00-00-00");
        insert_sample(&second, "/data/a.txt", &"11".repeat(32), b"content");
        second.close().unwrap();

        let repo = Repository::open(dir.path(), false).unwrap();
        let all = repo.find_all(&RepoFile::with_hash(&"11".repeat(32))).unwrap();
        assert_eq!(all.len(), 2);
        repo.close().unwrap();
    }

    #[test]
    fn test_parent_repository_rejects_mixed() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        make_snapshot(dir_a.path(), "2024-01-01_00-00-00").close().unwrap();
        make_snapshot(dir_b.path(), "2024-01-01_00-00-00").close().unwrap();

        let paths = vec![
            dir_a.path().join("2024-01-01_00-00-00"),
            dir_b.path().join("2024-01-01_00-00-00"),
        ];
        assert!(matches!(
            Repository::parent_repository(&paths),
            Err(VaultError::MixedRepositories { .. })
        ));
    }

    #[test]
    fn test_validate_snapshot_paths_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        make_snapshot(dir.path(), "2024-01-01_00-00-00").close().unwrap();
        let path = dir.path().join("2024-01-01_00-00-00");
        assert!(matches!(
            Repository::validate_snapshot_paths(&[path.clone(), path]),
            Err(VaultError::DuplicateSnapshot { .. })
        ));
    }
}
