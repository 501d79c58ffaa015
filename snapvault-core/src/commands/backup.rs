//! The backup engine.
//!
//! Walks every configured source tree and, per regular file, runs the dedup
//! decision: look up the signature `(source, size, time)` across all
//! snapshots, hash only when the signature is unknown (or `always_hash`),
//! then link against an existing archive when one is linkable, copy from it
//! when it is not, and import the source only when the content is new to the
//! repository. Each decision produces exactly one index row in the target
//! snapshot plus exactly one filesystem entry.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::config::BackupConfig;
use crate::error::{Result, VaultError};
use crate::fsutil;
use crate::repo_file::RepoFile;
use crate::repository::Repository;
use crate::session::SessionLog;
use crate::snapshot::Snapshot;
use crate::stats::{Stats, StatsSummary};

/// Options for the backup command.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Hash every source file, never trust a matching signature alone.
    pub always_hash: bool,
    /// Skip files whose signature already exists anywhere in the repository.
    pub incremental: bool,
    /// Extra `_suffix` appended to the new snapshot's directory name.
    pub suffix: Option<String>,
}

/// Result of one backup run.
#[derive(Debug, Serialize)]
pub struct BackupReport {
    /// Absolute path of the snapshot that was created.
    pub snapshot_path: String,
    /// Files whose content was new to the repository.
    pub files_imported: u64,
    /// Files realized as a link to (or copy of) an existing archive.
    pub files_duplicated: u64,
    /// Files skipped entirely (incremental mode).
    pub files_skipped: u64,
    /// Entries excluded by the configured exclude suffixes.
    pub excluded_blacklisted: u64,
    /// Symbolic links encountered and left behind.
    pub excluded_symlink: u64,
    /// Entries of unsupported type (sockets, devices, ...).
    pub excluded_unknown: u64,
    /// Per-file errors (the files were skipped, the run continued).
    pub errors: u64,
    /// Warnings emitted during the run.
    pub warnings: u64,
    /// Transfer counters.
    pub stats: StatsSummary,
}

/// Create a new snapshot of the configured sources inside `repository_path`.
pub fn execute(
    config_path: &Path,
    repository_path: &Path,
    options: &BackupOptions,
) -> Result<BackupReport> {
    let config = BackupConfig::load(config_path)?;
    let repository_path = fsutil::absolutize(repository_path);
    let sources = prepare_sources(&config, &repository_path)?;

    let mut repository = Repository::open(&repository_path, true)?;

    let mut snapshot_name = fsutil::current_timestamp();
    if let Some(ref suffix) = options.suffix {
        snapshot_name.push('_');
        snapshot_name.push_str(suffix);
    }
    let target = Snapshot::open(&repository.path().join(&snapshot_name), true)?;
    target.set_in_progress()?;
    let metadata_path = target.metadata_path();
    repository.attach_snapshot(target)?;

    let session = SessionLog::open(&metadata_path)?;
    let stats = Stats::new();

    let report = {
        let target = repository
            .snapshots()
            .last()
            .ok_or_else(|| VaultError::Invariant("target snapshot not attached".to_string()))?;
        session.info(&format!("backing up to snapshot: {}", target.path().display()));

        let mut run = BackupRun {
            repository: &repository,
            target,
            config: &config,
            options,
            stats: &stats,
            session: &session,
            imported: 0,
            duplicated: 0,
            skipped: 0,
            excluded_blacklisted: 0,
            excluded_symlink: 0,
            excluded_unknown: 0,
        };

        for source in &sources {
            session.debug(&format!("processing source: {}", source.display()));
            run.backup_tree(source)?;
        }

        target.clear_in_progress()?;
        session.info(&format!(
            "finished backing up to snapshot: {}",
            target.path().display()
        ));
        run.log_exclude_stats();
        session.log_stats(&stats);

        BackupReport {
            snapshot_path: target.path().display().to_string(),
            files_imported: run.imported,
            files_duplicated: run.duplicated,
            files_skipped: run.skipped,
            excluded_blacklisted: run.excluded_blacklisted,
            excluded_symlink: run.excluded_symlink,
            excluded_unknown: run.excluded_unknown,
            errors: session.error_count(),
            warnings: session.warning_count(),
            stats: stats.summary(),
        }
    };

    session.close();
    repository.close()?;
    Ok(report)
}

struct BackupRun<'a> {
    repository: &'a Repository,
    target: &'a Snapshot,
    config: &'a BackupConfig,
    options: &'a BackupOptions,
    stats: &'a Stats,
    session: &'a SessionLog,
    imported: u64,
    duplicated: u64,
    skipped: u64,
    excluded_blacklisted: u64,
    excluded_symlink: u64,
    excluded_unknown: u64,
}

impl BackupRun<'_> {
    /// Walk one source subtree, applying the per-file decision to every
    /// regular file. Excluded directories are pruned without descent.
    fn backup_tree(&mut self, source: &Path) -> Result<()> {
        let target_root = format_target_path(source, self.target.path(), self.session)?;

        let mut walker = WalkDir::new(source).follow_links(false).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.session
                        .error(&format!("cannot access, excluding: {}", e));
                    continue;
                }
            };
            let path = entry.path();

            if self.config.is_excluded(path) {
                self.session
                    .info(&format!("excluding (blacklisted):   {}", path.display()));
                self.excluded_blacklisted += 1;
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let relative = path
                .strip_prefix(source)
                .map_err(|_| VaultError::Invariant(format!("walk escaped source: {}", path.display())))?;
            let target_relative = if relative.as_os_str().is_empty() {
                target_root.clone()
            } else {
                target_root.join(relative)
            };

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                self.session
                    .info(&format!("excluding (symbolic link): {}", path.display()));
                self.excluded_symlink += 1;
            } else if file_type.is_dir() {
                if !self.options.incremental {
                    let target_dir = self.target.path().join(&target_relative);
                    if let Err(e) = fs::create_dir_all(&target_dir) {
                        self.session.error(&format!(
                            "cannot create directory, excluding: {}: {}",
                            path.display(),
                            e
                        ));
                        walker.skip_current_dir();
                    }
                }
            } else if file_type.is_file() {
                self.backup_file(path, &target_relative)?;
            } else {
                self.session
                    .info(&format!("excluding (unknown type):  {}", path.display()));
                self.excluded_unknown += 1;
            }
        }
        Ok(())
    }

    /// The per-file dedup decision. Per-file failures are logged and
    /// counted; only index errors and broken invariants propagate.
    fn backup_file(&mut self, source_path: &Path, target_relative: &Path) -> Result<()> {
        let mut target_file = RepoFile {
            source_path: source_path.to_path_buf(),
            relative_path: target_relative.to_path_buf(),
            parent_path: self.target.path().to_path_buf(),
            ..Default::default()
        };

        if !target_file.read_source_properties() {
            self.session.error(&format!(
                "cannot access, excluding: {}",
                target_file.source_display()
            ));
            return Ok(());
        }

        // Step 1: signature lookup across all snapshots, newest first.
        let mut existing = self
            .repository
            .find_file(&target_file.signature(), false)?;

        // Step 2: hash only when the signature is unknown, unless forced.
        if let (Some(existing_file), false) = (&existing, self.options.always_hash) {
            self.session.debug(&format!(
                "skipping hashing: {}",
                target_file.source_display()
            ));
            target_file.hash = existing_file.hash.clone();
        } else {
            self.session
                .debug(&format!("hashing: {}", target_file.source_display()));
            if !self.lock_and_hash(&mut target_file, &mut existing)? {
                return Ok(());
            }
        }

        // Step 3: incremental short-circuit, no new filesystem entry.
        if existing.is_some() && self.options.incremental {
            self.session.debug(&format!(
                "skipping linking: {}",
                target_file.source_display()
            ));
            self.skipped += 1;
            return Ok(());
        }

        // Step 4: broaden the search by hash when the signature match is
        // absent or exhausted its link budget.
        if existing.as_ref().map_or(true, |e| !e.is_linkable()) {
            existing = self
                .repository
                .find_file(&RepoFile::with_hash(&target_file.hash), true)?;
        }

        // Step 5: insert against the chosen predecessor, or import.
        if let Some(ref existing) = existing {
            if self.target.insert_file(
                &existing.full_path(),
                &target_file,
                existing.is_linkable(),
                self.stats,
            )? {
                self.session
                    .debug(&format!("duplicated: {}", target_file.source_display()));
                self.duplicated += 1;
            } else {
                self.session.error(&format!(
                    "cannot duplicate, excluding: {}",
                    target_file.source_display()
                ));
            }
            return Ok(());
        }

        // The lock taken for hashing must still be held while importing.
        if !target_file.is_source_locked() {
            return Err(VaultError::Invariant(format!(
                "importing without source lock: {}",
                target_file.source_display()
            )));
        }

        self.session
            .info(&format!("importing: {}", target_file.source_display()));
        if self
            .target
            .insert_file(source_path, &target_file, false, self.stats)?
        {
            self.imported += 1;
        } else {
            self.session.error(&format!(
                "cannot import, excluding: {}",
                target_file.source_display()
            ));
        }
        Ok(())
    }

    /// Lock the source, re-read its properties (they may have changed since
    /// the walk), redo the signature search if they did, hash, and enforce
    /// signature uniqueness.
    fn lock_and_hash(
        &self,
        target_file: &mut RepoFile,
        existing: &mut Option<RepoFile>,
    ) -> Result<bool> {
        if !target_file.lock_source() {
            self.session.error(&format!(
                "cannot lock, excluding: {}",
                target_file.source_display()
            ));
            return Ok(false);
        }

        let pre_lock_size = target_file.size;
        let pre_lock_time = target_file.time;
        if !target_file.read_source_properties() {
            self.session.error(&format!(
                "cannot access, excluding: {}",
                target_file.source_display()
            ));
            return Ok(false);
        }

        if target_file.size != pre_lock_size || target_file.time != pre_lock_time {
            // The file changed under us; the signature binding must be redone
            // for the uniqueness check below to hold.
            *existing = self
                .repository
                .find_file(&target_file.signature(), false)?;
        }

        if !target_file.hash_source(self.stats) {
            self.session.error(&format!(
                "cannot hash, excluding: {}",
                target_file.source_display()
            ));
            return Ok(false);
        }

        if let Some(existing) = existing {
            if existing.hash != target_file.hash {
                self.session.error(&format!(
                    "file with known signature but hash mismatch, excluding: {}",
                    target_file.source_display()
                ));
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn log_exclude_stats(&self) {
        if self.excluded_blacklisted > 0 {
            self.session.info(&format!(
                "excluded (blacklisted):   {}",
                self.excluded_blacklisted
            ));
        }
        if self.excluded_symlink > 0 {
            self.session
                .info(&format!("excluded (symbolic link): {}", self.excluded_symlink));
        }
        if self.excluded_unknown > 0 {
            self.session
                .info(&format!("excluded (unknown type):  {}", self.excluded_unknown));
        }
    }
}

/// Validate and canonicalize the configured sources against each other and
/// against the repository location.
fn prepare_sources(config: &BackupConfig, repository_path: &Path) -> Result<Vec<PathBuf>> {
    if config.sources.is_empty() {
        log::warn!("no sources specified, snapshot will be empty");
    }

    #[cfg(windows)]
    let sources = {
        let mut sources = config.sources.clone();
        for source in &mut sources {
            // "C:" without a separator is drive-relative; pin it to the root.
            let text = source.to_string_lossy().into_owned();
            if text.len() == 2 && text.as_bytes()[1] == b':' {
                *source = PathBuf::from(format!("{}\\", text));
            }
        }
        sources
    };
    #[cfg(not(windows))]
    let sources = config.sources.clone();

    for source in &sources {
        if config.is_excluded(source) {
            return Err(VaultError::Config(format!(
                "source is blacklisted: {}",
                source.display()
            )));
        }
        let metadata = fs::symlink_metadata(source).map_err(|_| {
            VaultError::Config(format!("source does not exist: {}", source.display()))
        })?;
        if metadata.file_type().is_symlink() {
            return Err(VaultError::Config(format!(
                "source is a symbolic link: {}",
                source.display()
            )));
        }
    }

    let mut canonical = Vec::with_capacity(sources.len());
    for source in &sources {
        let path = fs::canonicalize(source).map_err(|e| {
            VaultError::Config(format!("cannot resolve source: {}: {}", source.display(), e))
        })?;
        log::debug!("canonical source: {}", path.display());
        canonical.push(path);
    }

    for (i, first) in canonical.iter().enumerate() {
        for second in &canonical[i + 1..] {
            if fsutil::is_path_prefix(first, second) || fsutil::is_path_prefix(second, first) {
                return Err(VaultError::Config(format!(
                    "a source is equal to or part of another: {} and {}",
                    first.display(),
                    second.display()
                )));
            }
        }
    }

    for source in &canonical {
        if fsutil::is_path_prefix(repository_path, source) {
            return Err(VaultError::Config(format!(
                "a source is equal to or part of the repository: {}",
                source.display()
            )));
        }
        if fsutil::is_path_prefix(source, repository_path) && !config.is_excluded(repository_path) {
            return Err(VaultError::Config(format!(
                "a source is containing the repository: {}",
                source.display()
            )));
        }
    }

    Ok(canonical)
}

/// Encode a source path into one flat directory name: path separators and
/// the drive-letter colon become `#`.
fn encode_source_path(source: &Path) -> String {
    source
        .to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '#',
            other => other,
        })
        .collect()
}

/// The relative root for one source inside the target snapshot. When two
/// sources encode to the same name (disjoint volumes, same tail), a `_1` ..
/// `_99` suffix resolves the collision.
fn format_target_path(
    source: &Path,
    snapshot_path: &Path,
    session: &SessionLog,
) -> Result<PathBuf> {
    let encoded = encode_source_path(source);

    if !snapshot_path.join(&encoded).exists() {
        return Ok(PathBuf::from(encoded));
    }

    session.warn(&format!(
        "multiple sources map to the same target path, adding suffix to target: {}",
        encoded
    ));
    for number in 1..100 {
        let candidate = format!("{}_{}", encoded, number);
        if !snapshot_path.join(&candidate).exists() {
            return Ok(PathBuf::from(candidate));
        }
    }

    Err(VaultError::TargetPathExhausted {
        path: source.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_source_path() {
        assert_eq!(encode_source_path(Path::new("/home/user/docs")), "#home#user#docs");
        assert_eq!(encode_source_path(Path::new("C:\\Data\\x")), "C##Data#x");
    }

    #[test]
    fn test_format_target_path_collision_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionLog::detached();

        let first = format_target_path(Path::new("/data"), dir.path(), &session).unwrap();
        assert_eq!(first, PathBuf::from("#data"));

        fs::create_dir(dir.path().join("#data")).unwrap();
        let second = format_target_path(Path::new("/data"), dir.path(), &session).unwrap();
        assert_eq!(second, PathBuf::from("#data_1"));
        assert_eq!(session.warning_count(), 1);

        fs::create_dir(dir.path().join("#data_1")).unwrap();
        let third = format_target_path(Path::new("/data"), dir.path(), &session).unwrap();
        assert_eq!(third, PathBuf::from("#data_2"));
    }

    #[test]
    fn test_format_target_path_exhausts_after_99() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionLog::detached();

        fs::create_dir(dir.path().join("#data")).unwrap();
        for number in 1..100 {
            fs::create_dir(dir.path().join(format!("#data_{}", number))).unwrap();
        }
        assert!(matches!(
            format_target_path(Path::new("/data"), dir.path(), &session),
            Err(VaultError::TargetPathExhausted { .. })
        ));
    }

    #[test]
    fn test_prepare_sources_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig {
            sources: vec![dir.path().join("gone")],
            excludes: vec![],
        };
        assert!(matches!(
            prepare_sources(&config, &dir.path().join("repo")),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_prepare_sources_rejects_overlap() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let config = BackupConfig {
            sources: vec![dir.path().join("a"), dir.path().join("a/b")],
            excludes: vec![],
        };
        assert!(matches!(
            prepare_sources(&config, &dir.path().join("repo")),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_prepare_sources_rejects_blacklisted_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        let config = BackupConfig {
            sources: vec![dir.path().join("data")],
            excludes: vec![PathBuf::from("data")],
        };
        assert!(matches!(
            prepare_sources(&config, &dir.path().join("repo")),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_prepare_sources_rejects_source_inside_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(repo.join("data")).unwrap();
        let config = BackupConfig {
            sources: vec![repo.join("data")],
            excludes: vec![],
        };
        assert!(matches!(
            prepare_sources(&config, &fsutil::absolutize(&repo)),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_prepare_sources_rejects_repository_inside_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data");
        fs::create_dir_all(source.join("repo")).unwrap();
        let config = BackupConfig {
            sources: vec![source.clone()],
            excludes: vec![],
        };
        assert!(matches!(
            prepare_sources(&config, &fsutil::absolutize(&source.join("repo"))),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_prepare_sources_allows_blacklisted_nested_repository() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data");
        fs::create_dir_all(source.join("repo")).unwrap();
        let config = BackupConfig {
            sources: vec![source.clone()],
            excludes: vec![PathBuf::from("repo")],
        };
        let prepared = prepare_sources(&config, &fsutil::absolutize(&source.join("repo"))).unwrap();
        assert_eq!(prepared.len(), 1);
    }

    #[test]
    fn test_prepare_sources_rejects_symlink_source() {
        #[cfg(unix)]
        {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("real")).unwrap();
            std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
            let config = BackupConfig {
                sources: vec![dir.path().join("link")],
                excludes: vec![],
            };
            assert!(matches!(
                prepare_sources(&config, &dir.path().join("repo")),
                Err(VaultError::Config(_))
            ));
        }
    }
}
