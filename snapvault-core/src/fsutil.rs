//! Filesystem and path helpers shared across the engine.
//!
//! Path normalization, the platform path-length guard, permission flips for
//! the read-only index discipline, timestamped index backups, and the
//! `%Y-%m-%d_%H-%M-%S` snapshot-name clock.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use filetime::FileTime;

use crate::error::{Result, VaultError};

/// Format of snapshot directory names and index backup stamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Length of a formatted timestamp in characters.
pub const TIMESTAMP_LEN: usize = 19;

#[cfg(windows)]
const MAX_PATH_LEN: usize = 260;
#[cfg(not(windows))]
const MAX_PATH_LEN: usize = 4096;

/// Warn when a path is at risk of exceeding the platform maximum.
pub fn check_path_length(path: &Path) {
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        log::warn!(
            "path exceeds platform maximum and may be inaccessible; len={}, max={}, path={}",
            len,
            MAX_PATH_LEN,
            path.display()
        );
    }
}

/// Resolve a path to an absolute, lexically normalized form.
///
/// Uses `canonicalize` when the path exists; otherwise joins onto the
/// current directory and folds `.` / `..` components, so paths that are
/// about to be created still normalize consistently.
pub fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Component-wise test whether `prefix` is an ancestor of (or equal to) `path`.
pub fn is_path_prefix(prefix: &Path, path: &Path) -> bool {
    path.starts_with(prefix)
}

/// Case-insensitive test whether `suffix` ends the textual form of `path`.
///
/// This is the exclusion predicate: `.tmp`, `/thumbs.db` and full paths all
/// work as suffixes of the candidate's string form.
pub fn is_path_suffix(suffix: &Path, path: &Path) -> bool {
    let suffix = suffix.to_string_lossy().to_lowercase();
    if suffix.is_empty() {
        return false;
    }
    path.to_string_lossy().to_lowercase().ends_with(&suffix)
}

/// Strip write permission from a file. Logs on failure.
pub fn make_readonly(path: &Path) -> bool {
    match set_readonly_flag(path, true) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("cannot make read-only: {}: {}", path.display(), e);
            false
        }
    }
}

/// Restore write permission on a file. Silent on failure; the subsequent
/// open reports the real error.
pub fn make_writable(path: &Path) -> bool {
    set_readonly_flag(path, false).is_ok()
}

fn set_readonly_flag(path: &Path, readonly: bool) -> std::io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = permissions.mode();
        permissions.set_mode(if readonly { mode & !0o222 } else { mode | 0o200 });
    }
    #[cfg(not(unix))]
    permissions.set_readonly(readonly);
    fs::set_permissions(path, permissions)
}

/// Create a timestamped sibling copy of `file`, named
/// `<stem>_<mtime>.<ext>`. Skipped if that copy already exists. The copy's
/// mtime is aligned with the live file and its size verified afterwards.
pub fn make_backup(file: &Path) -> Result<()> {
    if !file.exists() {
        return Ok(());
    }

    let metadata = fs::metadata(file)?;
    let mtime = FileTime::from_last_modification_time(&metadata);
    let stamp = format_timestamp(metadata.modified()?);

    let stem = file.file_stem().unwrap_or_default().to_string_lossy();
    let mut name = format!("{}_{}", stem, stamp);
    if let Some(ext) = file.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    let backup_path = file.with_file_name(name);

    if let Ok(existing) = fs::metadata(&backup_path) {
        if existing.len() == metadata.len()
            && FileTime::from_last_modification_time(&existing) == mtime
        {
            return Ok(());
        }
        // Same-second rewrite of the file; the stamped name collides, so the
        // backup is refreshed to the newer state.
        make_writable(&backup_path);
    }

    fs::copy(file, &backup_path).map_err(|e| VaultError::IndexBackup {
        path: backup_path.clone(),
        reason: e.to_string(),
    })?;
    filetime::set_file_mtime(&backup_path, mtime)?;

    let backup_len = fs::metadata(&backup_path)
        .map_err(|e| VaultError::IndexBackup {
            path: backup_path.clone(),
            reason: e.to_string(),
        })?
        .len();
    if backup_len != metadata.len() {
        return Err(VaultError::IndexBackup {
            path: backup_path,
            reason: format!("size mismatch: {} vs {}", backup_len, metadata.len()),
        });
    }

    Ok(())
}

/// Depth-first removal of every directory under `dir` (including `dir`
/// itself) that is or becomes empty.
pub fn delete_empty_directories(dir: &Path) {
    if !dir.is_dir() {
        return;
    }

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            delete_empty_directories(&entry.path());
        }
    }

    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                if let Err(e) = fs::remove_dir(dir) {
                    log::warn!("cannot delete directory: {}: {}", dir.display(), e);
                }
            }
        }
        Err(e) => log::warn!("cannot read directory: {}: {}", dir.display(), e),
    }
}

/// Format a system time as a snapshot-name timestamp in local time.
pub fn format_timestamp(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.format(TIMESTAMP_FORMAT).to_string()
}

/// The current local time as a snapshot-name timestamp.
pub fn current_timestamp() -> String {
    format_timestamp(SystemTime::now())
}

/// Parse the leading timestamp of a snapshot directory name. Names may carry
/// an arbitrary `_suffix` after the timestamp.
pub fn parse_timestamp_prefix(name: &str) -> Option<NaiveDateTime> {
    if name.len() < TIMESTAMP_LEN || !name.is_char_boundary(TIMESTAMP_LEN) {
        return None;
    }
    NaiveDateTime::parse_from_str(&name[..TIMESTAMP_LEN], TIMESTAMP_FORMAT).ok()
}

/// Parse a full snapshot-name timestamp back to a system time.
pub fn parse_timestamp(stamp: &str) -> Option<SystemTime> {
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(SystemTime::from)
}

/// Render a count with thousands separators, right-aligned to `min_width`.
pub fn group_digits(number: u64, min_width: usize) -> String {
    let digits = number.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if grouped.len() < min_width {
        format!("{:>width$}", grouped, width = min_width)
    } else {
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_suffix_case_insensitive() {
        assert!(is_path_suffix(Path::new(".TMP"), Path::new("/data/work/a.tmp")));
        assert!(is_path_suffix(
            Path::new("/thumbs.db"),
            Path::new("/home/user/pics/Thumbs.db")
        ));
        assert!(!is_path_suffix(Path::new(".tmp"), Path::new("/data/a.tmpx")));
        assert!(!is_path_suffix(Path::new(""), Path::new("/data/a.tmp")));
    }

    #[test]
    fn test_path_suffix_matches_whole_name_segment_or_not() {
        // Plain string suffix semantics: "_NO_BACKUP" hits any path ending in it.
        assert!(is_path_suffix(
            Path::new("_NO_BACKUP"),
            Path::new("/srv/cache_NO_BACKUP")
        ));
    }

    #[test]
    fn test_path_prefix() {
        assert!(is_path_prefix(Path::new("/a/b"), Path::new("/a/b/c")));
        assert!(is_path_prefix(Path::new("/a/b"), Path::new("/a/b")));
        assert!(!is_path_prefix(Path::new("/a/b"), Path::new("/a/bc")));
    }

    #[test]
    fn test_absolutize_folds_dot_components() {
        let abs = absolutize(Path::new("/a/b/../c/./d"));
        assert_eq!(abs, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn test_timestamp_prefix_parsing() {
        assert!(parse_timestamp_prefix("2024-01-01_00-00-00").is_some());
        assert!(parse_timestamp_prefix("2024-01-01_00-00-00_full").is_some());
        assert!(parse_timestamp_prefix("2024-13-01_00-00-00").is_none());
        assert!(parse_timestamp_prefix("not-a-snapshot").is_none());
        assert!(parse_timestamp_prefix("").is_none());
    }

    #[test]
    fn test_timestamp_format_round_trip() {
        let stamp = current_timestamp();
        assert_eq!(stamp.len(), TIMESTAMP_LEN);
        let parsed = parse_timestamp(&stamp).expect("stamp should parse");
        assert_eq!(format_timestamp(parsed), stamp);
    }

    #[test]
    fn test_group_digits() {
        assert_eq!(group_digits(0, 0), "0");
        assert_eq!(group_digits(999, 0), "999");
        assert_eq!(group_digits(1000, 0), "1,000");
        assert_eq!(group_digits(1234567, 0), "1,234,567");
        assert_eq!(group_digits(42, 6), "    42");
    }

    #[test]
    fn test_make_readonly_and_writable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        fs::write(&file, b"data").unwrap();

        assert!(make_readonly(&file));
        assert!(fs::metadata(&file).unwrap().permissions().readonly());
        assert!(make_writable(&file));
        assert!(!fs::metadata(&file).unwrap().permissions().readonly());
    }

    #[test]
    fn test_make_backup_creates_stamped_copy() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("db.sqlite");
        fs::write(&file, b"index-bytes").unwrap();

        make_backup(&file).unwrap();

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("db_") && n.ends_with(".sqlite"))
            .collect();
        assert_eq!(backups.len(), 1);

        // Backing up again with unchanged mtime is a no-op.
        make_backup(&file).unwrap();
        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_delete_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("d")).unwrap();
        fs::write(root.join("d/keep.txt"), b"x").unwrap();

        delete_empty_directories(&root);

        assert!(!root.join("a").exists());
        assert!(root.join("d/keep.txt").exists());
    }
}
