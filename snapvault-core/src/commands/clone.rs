//! Re-materializing a repository into a different directory.
//!
//! Ordinary filesystem copies do not preserve hard links, so moving a
//! repository would multiply its physical size. Clone rebuilds every
//! snapshot, oldest first, into a fresh target repository, re-running the
//! dedup decision against what has already been cloned: look up by
//! signature, broaden by hash, link when possible, copy otherwise.

use std::path::Path;

use serde::Serialize;

use crate::error::{Result, VaultError};
use crate::repo_file::RepoFile;
use crate::repository::Repository;
use crate::session::SessionLog;
use crate::snapshot::Snapshot;
use crate::stats::{Stats, StatsSummary};

/// Options for the clone command.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Re-hash every source archive instead of trusting its recorded hash.
    pub always_hash: bool,
    /// Skip files whose signature was already cloned into another snapshot.
    pub incremental: bool,
    /// Extra `_suffix` appended to every cloned snapshot's name.
    pub suffix: Option<String>,
}

/// Result of one clone run.
#[derive(Debug, Serialize)]
pub struct CloneReport {
    pub snapshots_cloned: u64,
    /// Files realized as a link to (or copy of) an already-cloned archive.
    pub files_duplicated: u64,
    /// Files whose content entered the target repository for the first time.
    pub files_cloned: u64,
    /// Files skipped entirely (incremental mode).
    pub files_skipped: u64,
    pub errors: u64,
    pub warnings: u64,
    pub stats: StatsSummary,
}

#[derive(Default)]
struct CloneCounters {
    duplicated: u64,
    cloned: u64,
    skipped: u64,
}

/// Clone `source_path` into a fresh repository at `target_path`.
pub fn execute(
    source_path: &Path,
    target_path: &Path,
    options: &CloneOptions,
) -> Result<CloneReport> {
    let source_repository = Repository::open(source_path, false)?;
    let mut target_repository = Repository::open(target_path, true)?;

    let stats = Stats::new();
    let mut counters = CloneCounters::default();
    let mut errors = 0;
    let mut warnings = 0;

    for source_snapshot in source_repository.snapshots() {
        let mut name = source_snapshot.name();
        if let Some(ref suffix) = options.suffix {
            name.push('_');
            name.push_str(suffix);
        }

        let target_snapshot = Snapshot::open(&target_repository.path().join(&name), true)?;
        target_snapshot.set_in_progress()?;
        let metadata_path = target_snapshot.metadata_path();
        target_repository.attach_snapshot(target_snapshot)?;

        let session = SessionLog::open(&metadata_path)?;
        {
            let target_snapshot = target_repository
                .snapshots()
                .last()
                .ok_or_else(|| VaultError::Invariant("target snapshot not attached".to_string()))?;
            session.info(&format!(
                "cloning to snapshot: {}",
                target_snapshot.path().display()
            ));

            for source_file in source_snapshot.find_all(&RepoFile::default())? {
                clone_file(
                    &source_file,
                    &target_repository,
                    target_snapshot,
                    options,
                    &stats,
                    &session,
                    &mut counters,
                )?;
            }

            target_snapshot.clear_in_progress()?;
            session.info(&format!(
                "finished cloning to snapshot: {}",
                target_snapshot.path().display()
            ));
            session.log_stats(&stats);
        }
        errors += session.error_count();
        warnings += session.warning_count();
        session.close();
    }

    let snapshots_cloned = source_repository.snapshots().len() as u64;
    if snapshots_cloned > 1 {
        log::info!("finished cloning {} snapshots", snapshots_cloned);
    }

    source_repository.close()?;
    target_repository.close()?;

    Ok(CloneReport {
        snapshots_cloned,
        files_duplicated: counters.duplicated,
        files_cloned: counters.cloned,
        files_skipped: counters.skipped,
        errors,
        warnings,
        stats: stats.summary(),
    })
}

/// The simplified dedup decision for one source row: signature lookup in
/// the target repository, then hash broadening, then link or copy.
fn clone_file(
    source_file: &RepoFile,
    target_repository: &Repository,
    target_snapshot: &Snapshot,
    options: &CloneOptions,
    stats: &Stats,
    session: &SessionLog,
    counters: &mut CloneCounters,
) -> Result<()> {
    let mut target_file = RepoFile {
        source_path: source_file.source_path.clone(),
        size: source_file.size,
        time: source_file.time,
        hash: source_file.hash.clone(),
        relative_path: source_file.relative_path.clone(),
        parent_path: target_snapshot.path().to_path_buf(),
        ..Default::default()
    };

    if options.always_hash {
        let mut rehashed = source_file.clone();
        session.debug(&format!("hashing: {}", source_file));
        if !rehashed.hash_archive(stats) {
            session.error(&format!("cannot hash, excluding: {}", source_file));
            return Ok(());
        }
        if rehashed.hash != source_file.hash {
            session.error(&format!(
                "recorded hash does not match content, excluding: {} index: {} content: {}",
                source_file, source_file.hash, rehashed.hash
            ));
            return Ok(());
        }
        target_file.hash = rehashed.hash;
    }

    let mut existing = target_repository.find_file(&target_file.signature(), false)?;

    if let Some(ref existing_file) = existing {
        if existing_file.hash != target_file.hash {
            session.error(&format!(
                "file with known signature but hash mismatch, excluding: {}",
                target_file
            ));
            return Ok(());
        }
    }

    if existing.is_some() && options.incremental {
        session.debug(&format!("skipping linking: {}", target_file));
        counters.skipped += 1;
        return Ok(());
    }

    if existing.as_ref().map_or(true, |e| !e.is_linkable()) {
        existing = target_repository.find_file(&RepoFile::with_hash(&target_file.hash), true)?;
    }

    if let Some(ref existing_file) = existing {
        if target_snapshot.insert_file(
            &existing_file.full_path(),
            &target_file,
            existing_file.is_linkable(),
            stats,
        )? {
            session.debug(&format!("duplicated: {}", target_file));
            counters.duplicated += 1;
        } else {
            session.error(&format!("cannot duplicate, excluding: {}", target_file));
        }
        return Ok(());
    }

    session.info(&format!("cloning: {}", target_file));
    if target_snapshot.insert_file(&source_file.full_path(), &target_file, false, stats)? {
        counters.cloned += 1;
    } else {
        session.error(&format!("cannot clone, excluding: {}", target_file));
    }
    Ok(())
}
