//! Dropping index rows that reference missing archive files.
//!
//! After manual deletions inside a snapshot, the index still carries rows
//! for the removed files. Purge walks every row and deletes the ones whose
//! archive no longer exists, leaving the filesystem untouched.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;
use crate::repo_file::RepoFile;
use crate::session::SessionLog;
use crate::snapshot::Snapshot;

/// Options for the purge command.
#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    /// Rewrite each index after purging.
    pub compact_db: bool,
}

/// Result of one purge run.
#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub snapshots_purged: u64,
    /// Index rows removed because their archive file was missing.
    pub rows_purged: u64,
    pub errors: u64,
    pub warnings: u64,
}

/// Purge one or more snapshots.
pub fn execute(paths: &[PathBuf], options: &PurgeOptions) -> Result<PurgeReport> {
    let snapshot_paths = super::validated_snapshot_paths(paths)?;

    let mut rows_purged = 0;
    let mut errors = 0;
    let mut warnings = 0;

    for snapshot_path in &snapshot_paths {
        let snapshot = Snapshot::open(snapshot_path, false)?;
        snapshot.set_in_progress()?;

        let session = SessionLog::open(&snapshot.metadata_path())?;
        session.info(&format!("purging snapshot: {}", snapshot.path().display()));

        for file in snapshot.find_all(&RepoFile::default())? {
            if file.is_existing() {
                session.debug(&format!("keeping: {}", file));
                continue;
            }
            session.info(&format!("purging: {}", file));
            rows_purged += snapshot.remove_index_rows(&file)? as u64;
        }

        if options.compact_db {
            session.info("compacting index");
            snapshot.compact()?;
        }

        snapshot.clear_in_progress()?;
        session.info(&format!(
            "finished purging snapshot: {}",
            snapshot.path().display()
        ));
        errors += session.error_count();
        warnings += session.warning_count();
        session.close();
        snapshot.close()?;
    }

    if snapshot_paths.len() > 1 {
        log::info!("finished purging {} snapshots", snapshot_paths.len());
    }

    Ok(PurgeReport {
        snapshots_purged: snapshot_paths.len() as u64,
        rows_purged,
        errors,
        warnings,
    })
}
