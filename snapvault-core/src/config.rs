//! The backup sources file.
//!
//! A small sectioned format, interpreted as UTF-8:
//!
//! ```text
//! * lines starting with "*" are comments
//! [sources]
//! /home/user/documents
//! ../relative/data
//!
//! * excludes are case-insensitive path suffixes
//! [excludes]
//! /thumbs.db
//! .tmp
//! _NO_BACKUP
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};
use crate::fsutil;

/// Parsed sources file: what to back up and what to leave out.
#[derive(Debug, Clone, Default)]
pub struct BackupConfig {
    /// Files or directories to back up, in configuration order.
    pub sources: Vec<PathBuf>,
    /// Path suffixes excluded from the backup, matched case-insensitively.
    pub excludes: Vec<PathBuf>,
}

impl BackupConfig {
    /// Read and parse a sources file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Config(format!("cannot open config: {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse the sources file format.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = BackupConfig::default();
        let mut section = String::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('*') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(VaultError::Config(format!(
                        "invalid line in config file: {}",
                        line
                    )));
                };
                section = name.to_lowercase();
                continue;
            }
            match section.as_str() {
                "sources" => {
                    log::debug!("source: {}", line);
                    config.sources.push(PathBuf::from(line));
                }
                "excludes" => {
                    log::debug!("exclude: {}", line);
                    config.excludes.push(PathBuf::from(line));
                }
                _ => {
                    return Err(VaultError::Config(format!(
                        "invalid section in config file: {}",
                        section
                    )));
                }
            }
        }

        Ok(config)
    }

    /// The exclusion predicate: `path` is excluded iff one of the configured
    /// excludes is a case-insensitive suffix of its textual form.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excludes
            .iter()
            .any(|exclude| fsutil::is_path_suffix(exclude, path))
    }
}
