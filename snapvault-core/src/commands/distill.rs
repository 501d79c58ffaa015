//! Shedding files whose content also lives elsewhere in the repository.
//!
//! Distilling a snapshot deletes every archive file whose hash is present,
//! with an existing file, in any *other* snapshot of the same repository —
//! leaving only the content that is unique to the distilled snapshot.
//! Directories that are or become empty are removed afterwards.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;
use crate::fsutil;
use crate::repo_file::RepoFile;
use crate::repository::Repository;
use crate::session::SessionLog;
use crate::stats::{Stats, StatsSummary};

/// Options for the distill command.
#[derive(Debug, Clone, Default)]
pub struct DistillOptions {
    /// Rewrite each index after distilling.
    pub compact_db: bool,
}

/// Result of one distill run.
#[derive(Debug, Serialize)]
pub struct DistillReport {
    pub snapshots_distilled: u64,
    /// Files deleted because their content survives elsewhere.
    pub files_shed: u64,
    /// Files kept because their content is unique to the snapshot.
    pub files_kept: u64,
    pub errors: u64,
    pub warnings: u64,
    pub stats: StatsSummary,
}

/// Distill one or more snapshots of the same repository.
pub fn execute(paths: &[PathBuf], options: &DistillOptions) -> Result<DistillReport> {
    let snapshot_paths = super::validated_snapshot_paths(paths)?;
    let mut repository = Repository::parent_repository(&snapshot_paths)?;

    let stats = Stats::new();
    let mut files_shed = 0;
    let mut files_kept = 0;
    let mut errors = 0;
    let mut warnings = 0;

    for snapshot_path in &snapshot_paths {
        // Detached, so repository lookups see only the *other* snapshots.
        let snapshot = repository.detach_snapshot(snapshot_path)?;
        snapshot.set_in_progress()?;

        let session = SessionLog::open(&snapshot.metadata_path())?;
        session.info(&format!(
            "distilling snapshot: {}",
            snapshot.path().display()
        ));

        for file in snapshot.find_all(&RepoFile::default())? {
            let survives_elsewhere = repository
                .find_all(&RepoFile::with_hash(&file.hash))?
                .iter()
                .any(RepoFile::is_existing);

            if !survives_elsewhere {
                session.info(&format!("keeping unique: {}", file));
                files_kept += 1;
                continue;
            }

            if snapshot.delete_file(&file, &stats)? {
                files_shed += 1;
            } else {
                session.error(&format!("cannot delete: {}", file));
            }
        }

        session.info("deleting empty directories");
        fsutil::delete_empty_directories(snapshot.path());

        if options.compact_db {
            session.info("compacting index");
            snapshot.compact()?;
        }

        snapshot.clear_in_progress()?;
        session.info(&format!(
            "finished distilling snapshot: {}",
            snapshot.path().display()
        ));
        session.log_stats(&stats);
        errors += session.error_count();
        warnings += session.warning_count();
        session.close();
        snapshot.close()?;
    }

    if snapshot_paths.len() > 1 {
        log::info!("finished distilling {} snapshots", snapshot_paths.len());
    }

    repository.close()?;

    Ok(DistillReport {
        snapshots_distilled: snapshot_paths.len() as u64,
        files_shed,
        files_kept,
        errors,
        warnings,
        stats: stats.summary(),
    })
}
