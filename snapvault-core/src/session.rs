//! Per-snapshot session log.
//!
//! Commands that mutate a snapshot open a [`SessionLog`] in its metadata
//! directory. Every line goes both through the `log` facade (for the
//! console) and into `log.txt` next to the index, so the snapshot documents
//! its own history. Warning and error counts feed the end-of-run summary.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::fsutil;
use crate::stats::Stats;

/// Name of the session log file inside a snapshot's metadata directory.
pub const LOG_FILE_NAME: &str = "log.txt";

/// A session log bound to a snapshot's metadata directory, or detached
/// (console only) for read-only commands.
pub struct SessionLog {
    file: RefCell<Option<File>>,
    path: Option<PathBuf>,
    warnings: Cell<u64>,
    errors: Cell<u64>,
}

impl SessionLog {
    /// Open (truncate) `log.txt` inside `metadata_dir`.
    pub fn open(metadata_dir: &Path) -> Result<Self> {
        let path = metadata_dir.join(LOG_FILE_NAME);
        fsutil::make_writable(&path);
        let file = File::create(&path)?;
        Ok(SessionLog {
            file: RefCell::new(Some(file)),
            path: Some(path),
            warnings: Cell::new(0),
            errors: Cell::new(0),
        })
    }

    /// A console-only session with counters but no log file.
    pub fn detached() -> Self {
        SessionLog {
            file: RefCell::new(None),
            path: None,
            warnings: Cell::new(0),
            errors: Cell::new(0),
        }
    }

    pub fn info(&self, message: &str) {
        log::info!("{}", message);
        self.write_line(message);
    }

    pub fn debug(&self, message: &str) {
        log::debug!("{}", message);
        self.write_line(message);
    }

    pub fn warn(&self, message: &str) {
        self.warnings.set(self.warnings.get() + 1);
        log::warn!("{}", message);
        self.write_line(&format!("WARNING: {}", message));
    }

    pub fn error(&self, message: &str) {
        self.errors.set(self.errors.get() + 1);
        log::error!("{}", message);
        self.write_line(&format!("ERROR: {}", message));
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings.get()
    }

    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }

    /// Write the standard end-of-run summary: transfer counters first, then
    /// warning and error totals.
    pub fn log_stats(&self, stats: &Stats) {
        let s = stats.summary();
        self.info(&format!(
            "hashed:  {} files {} bytes",
            fsutil::group_digits(s.files_hashed, 11),
            fsutil::group_digits(s.bytes_hashed, 19)
        ));
        self.info(&format!(
            "copied:  {} files {} bytes",
            fsutil::group_digits(s.files_copied, 11),
            fsutil::group_digits(s.bytes_copied, 19)
        ));
        self.info(&format!(
            "linked:  {} files {} bytes",
            fsutil::group_digits(s.files_linked, 11),
            fsutil::group_digits(s.bytes_linked, 19)
        ));
        self.info(&format!(
            "deleted: {} files {} bytes",
            fsutil::group_digits(s.files_deleted, 11),
            fsutil::group_digits(s.bytes_deleted, 19)
        ));
        if self.warning_count() > 0 {
            self.info(&format!("warnings: {}", self.warning_count()));
        }
        if self.error_count() > 0 {
            self.info(&format!("errors:   {}", self.error_count()));
        }
    }

    /// Flush and close the file, then make it read-only.
    pub fn close(&self) {
        let file = self.file.borrow_mut().take();
        if let Some(mut file) = file {
            let _ = file.flush();
            drop(file);
        }
        if let Some(ref path) = self.path {
            fsutil::make_readonly(path);
        }
    }

    fn write_line(&self, line: &str) {
        if let Some(ref mut file) = *self.file.borrow_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                log::warn!("cannot write session log: {}", e);
            }
        }
    }
}
