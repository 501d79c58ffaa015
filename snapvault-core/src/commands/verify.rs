//! Snapshot consistency checking.
//!
//! Verifies index integrity, archive file existence, hash consistency
//! across hard links (each inode is checked once), optionally re-hashes
//! every archive, and finally checks signature uniqueness across the whole
//! verified set. Can emit a CSV file table keyed by filesystem index.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;
use crate::fsutil;
use crate::repo_file::RepoFile;
use crate::session::SessionLog;
use crate::snapshot::Snapshot;
use crate::stats::{Stats, StatsSummary};

/// Options for the verify command.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Re-hash every archive file and compare against the recorded hash.
    pub verify_hash: bool,
    /// Write a CSV file table to the working directory.
    pub write_file_table: bool,
}

/// Result of one verify run.
#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub snapshots_verified: u64,
    pub files_verified: u64,
    pub errors: u64,
    pub warnings: u64,
    /// Path of the CSV file table, when one was written.
    pub file_table_path: Option<String>,
    pub stats: StatsSummary,
}

/// Verify a repository or an explicit list of snapshots.
pub fn execute(paths: &[PathBuf], options: &VerifyOptions) -> Result<VerifyReport> {
    let snapshot_paths = super::resolve_repository_or_snapshots(paths)?;

    let session = SessionLog::detached();
    let stats = Stats::new();
    let mut file_table = FileTable::new(&snapshot_paths);
    let mut files_verified = 0;

    for (snapshot_idx, snapshot_path) in snapshot_paths.iter().enumerate() {
        let snapshot = Snapshot::open(snapshot_path, false)?;
        session.info(&format!("verifying snapshot: {}", snapshot.path().display()));

        session.info("verifying database integrity");
        if !snapshot.check_integrity()? {
            session.error(&format!(
                "database integrity check failed, skipping file verification: {}",
                snapshot.path().display()
            ));
        } else {
            session.info("verifying files");
            files_verified += verify_files(
                &mut file_table,
                &snapshot,
                snapshot_idx,
                options,
                &stats,
                &session,
            )?;
        }

        session.info(&format!(
            "finished verifying snapshot: {}",
            snapshot.path().display()
        ));
        snapshot.close()?;
    }

    session.info("verifying file signature uniqueness");
    file_table.verify_signature_uniqueness(&session);

    let file_table_path = if options.write_file_table {
        Some(file_table.write_csv(&session)?)
    } else {
        None
    };

    session.info(&format!(
        "finished verifying {} snapshots",
        snapshot_paths.len()
    ));
    session.log_stats(&stats);
    session.close();

    Ok(VerifyReport {
        snapshots_verified: snapshot_paths.len() as u64,
        files_verified,
        errors: session.error_count(),
        warnings: session.warning_count(),
        file_table_path,
        stats: stats.summary(),
    })
}

fn verify_files(
    file_table: &mut FileTable,
    snapshot: &Snapshot,
    snapshot_idx: usize,
    options: &VerifyOptions,
    stats: &Stats,
    session: &SessionLog,
) -> Result<u64> {
    let files = snapshot.find_all(&RepoFile::default())?;
    let count = files.len() as u64;

    for mut file in files {
        session.debug(&format!("verifying: {}", file));

        if !file.is_existing() {
            session.error(&format!("missing file: {}", file));
            continue;
        }

        let mut table_slot = None;
        match file.file_system_index() {
            None => {
                session.error(&format!("cannot read file system index: {}", file));
            }
            Some(fs_index) => {
                let entry = file_table.entry(fs_index);
                entry.ref_counts[snapshot_idx] += 1;
                if entry.file.has_hash() {
                    // This inode was already checked through another link.
                    if entry.file.hash != file.hash {
                        session.error(&format!(
                            "inconsistent hash: {} index: {} content: {}",
                            file, file.hash, entry.file.hash
                        ));
                    } else {
                        session.debug(&format!("recurring link: {}", file));
                    }
                    continue;
                }
                table_slot = Some(fs_index);
            }
        }

        if options.verify_hash {
            let recorded = file.hash.clone();
            session.debug(&format!("hashing: {}", file));
            if !file.hash_archive(stats) {
                session.error(&format!("cannot hash: {}", file));
                file.hash = "ERROR".to_string();
            } else if recorded != file.hash {
                session.error(&format!(
                    "inconsistent hash: {} index: {} content: {}",
                    file, recorded, file.hash
                ));
            }
        }

        if let Some(fs_index) = table_slot {
            file_table.entry(fs_index).file = file;
        }
    }

    Ok(count)
}

/// One row per distinct filesystem index across the verified snapshots,
/// with a reference count per snapshot.
struct FileTable {
    snapshot_names: Vec<String>,
    entries: Vec<FileTableEntry>,
    by_index: HashMap<u64, usize>,
}

struct FileTableEntry {
    fs_index: u64,
    file: RepoFile,
    ref_counts: Vec<u64>,
}

impl FileTable {
    fn new(snapshot_paths: &[PathBuf]) -> Self {
        FileTable {
            snapshot_names: snapshot_paths
                .iter()
                .map(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                })
                .collect(),
            entries: Vec::new(),
            by_index: HashMap::new(),
        }
    }

    fn entry(&mut self, fs_index: u64) -> &mut FileTableEntry {
        let slot = match self.by_index.get(&fs_index) {
            Some(&slot) => slot,
            None => {
                let slot = self.entries.len();
                self.entries.push(FileTableEntry {
                    fs_index,
                    file: RepoFile::default(),
                    ref_counts: vec![0; self.snapshot_names.len()],
                });
                self.by_index.insert(fs_index, slot);
                slot
            }
        };
        &mut self.entries[slot]
    }

    /// Files sharing `(size, time, source)` must share their hash; anything
    /// else means the signature shortcut would resurrect wrong content.
    fn verify_signature_uniqueness(&self, session: &SessionLog) {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by(|&a, &b| {
            let fa = &self.entries[a].file;
            let fb = &self.entries[b].file;
            (fa.size, fa.time, &fa.source_path).cmp(&(fb.size, fb.time, &fb.source_path))
        });

        for pair in order.windows(2) {
            let first = &self.entries[pair[0]].file;
            let second = &self.entries[pair[1]].file;
            if first.size == second.size
                && first.time == second.time
                && first.source_path == second.source_path
                && first.hash != second.hash
            {
                session.error(&format!(
                    "files with same signature but different hash: {} and {}",
                    first.source_display(),
                    second.source_display()
                ));
            }
        }
    }

    /// Write the table as `file_table_<ts>.csv` in the working directory
    /// and make it read-only.
    fn write_csv(&self, session: &SessionLog) -> Result<String> {
        let output_path = std::env::current_dir()?
            .join(format!("file_table_{}.csv", fsutil::current_timestamp()));
        session.info(&format!("writing file table to {}", output_path.display()));

        let mut output = std::fs::File::create(&output_path)?;
        write!(output, "file index")?;
        for name in &self.snapshot_names {
            write!(output, ",{}", name)?;
        }
        writeln!(output, ",size,time,hash,first path,first source")?;

        for entry in &self.entries {
            write!(output, "{}", entry.fs_index)?;
            for count in &entry.ref_counts {
                write!(output, ",{}", count)?;
            }
            let file = &entry.file;
            writeln!(
                output,
                ",{},{},{},{},{}",
                file.size.unwrap_or(0),
                file.time
                    .map(|t| fsutil::format_timestamp(t.to_system_time()))
                    .unwrap_or_default(),
                file.hash,
                csv_quote(&file.full_path().to_string_lossy()),
                csv_quote(&file.source_path.to_string_lossy()),
            )?;
        }

        output.flush()?;
        drop(output);
        fsutil::make_readonly(&output_path);

        Ok(output_path.display().to_string())
    }
}

fn csv_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Timestamp;

    fn table_file(source: &str, hash: &str) -> RepoFile {
        RepoFile {
            source_path: PathBuf::from(source),
            size: Some(10),
            time: Some(Timestamp::from_nanos(42)),
            hash: hash.to_string(),
            relative_path: PathBuf::from("f"),
            parent_path: PathBuf::from("/repo/snap"),
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_is_keyed_by_filesystem_index() {
        let mut table = FileTable::new(&[PathBuf::from("/r/2024-01-01_00-00-00")]);
        table.entry(7).ref_counts[0] += 1;
        table.entry(7).ref_counts[0] += 1;
        table.entry(9).ref_counts[0] += 1;

        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entry(7).ref_counts[0], 2);
        assert_eq!(table.entry(9).ref_counts[0], 1);
    }

    #[test]
    fn test_signature_uniqueness_flags_conflicts() {
        let mut table = FileTable::new(&[PathBuf::from("/r/2024-01-01_00-00-00")]);
        table.entry(1).file = table_file("/data/a.txt", &"11".repeat(32));
        table.entry(2).file = table_file("/data/a.txt", &"22".repeat(32));

        let session = SessionLog::detached();
        table.verify_signature_uniqueness(&session);
        assert_eq!(session.error_count(), 1);
    }

    #[test]
    fn test_signature_uniqueness_accepts_identical_hashes() {
        let mut table = FileTable::new(&[PathBuf::from("/r/2024-01-01_00-00-00")]);
        table.entry(1).file = table_file("/data/a.txt", &"11".repeat(32));
        table.entry(2).file = table_file("/data/a.txt", &"11".repeat(32));

        let session = SessionLog::detached();
        table.verify_signature_uniqueness(&session);
        assert_eq!(session.error_count(), 0);
    }

    #[test]
    fn test_csv_quote_doubles_quotes() {
        assert_eq!(csv_quote("plain"), "\"plain\"");
        assert_eq!(csv_quote("a\"b"), "\"a\"\"b\"");
    }
}
