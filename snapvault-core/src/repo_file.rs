//! The repository file descriptor.
//!
//! A [`RepoFile`] is a value describing one logical file: where it came from
//! (`source_path`), what it contains (`size`, `time`, `hash`), and where it
//! lives inside a snapshot (`parent_path` / `relative_path`). It also carries
//! the operations that realize the file on disk: locked reading and hashing
//! of the source, copying with mtime preservation, hard linking, deletion.
//!
//! A `RepoFile` with only some fields set doubles as a constraint pattern
//! for index queries; unset fields do not constrain.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use sha2::{Digest, Sha256};

use crate::fsutil;
use crate::stats::Stats;
use crate::units::Timestamp;

/// Hard-link ceiling per inode. NTFS caps directory entries per file at
/// 1024; common POSIX filesystems allow 65 000 links.
#[cfg(windows)]
pub const MAX_HARD_LINK_COUNT: u64 = 1023;
#[cfg(not(windows))]
pub const MAX_HARD_LINK_COUNT: u64 = 65_000;

/// Files below this size are always copied, never hard-linked.
#[cfg(windows)]
pub const HARD_LINK_MIN_BYTES: u64 = 513;
#[cfg(not(windows))]
pub const HARD_LINK_MIN_BYTES: u64 = 0;

const LOCK_RETRIES: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Descriptor of one logical file inside a snapshot.
#[derive(Debug, Clone, Default)]
pub struct RepoFile {
    /// Original path of the backed-up file.
    pub source_path: PathBuf,
    /// Content size in bytes; `None` until read or when unconstrained.
    pub size: Option<u64>,
    /// Modification time; `None` until read or when unconstrained.
    pub time: Option<Timestamp>,
    /// Lowercase-hex SHA-256 of the content; empty until hashed.
    pub hash: String,
    /// Path of the archive file relative to the snapshot directory.
    pub relative_path: PathBuf,
    /// Absolute path of the owning snapshot directory.
    pub parent_path: PathBuf,
    pub(crate) source_lock: Option<Rc<File>>,
}

impl RepoFile {
    /// A constraint pattern matching this file's signature
    /// `(source, size, time)`.
    pub fn signature(&self) -> RepoFile {
        RepoFile {
            source_path: self.source_path.clone(),
            size: self.size,
            time: self.time,
            ..Default::default()
        }
    }

    /// A constraint pattern matching a content hash.
    pub fn with_hash(hash: &str) -> RepoFile {
        RepoFile {
            hash: hash.to_string(),
            ..Default::default()
        }
    }

    /// Absolute location of the archive file.
    pub fn full_path(&self) -> PathBuf {
        self.parent_path.join(&self.relative_path)
    }

    pub fn has_hash(&self) -> bool {
        !self.hash.is_empty()
    }

    pub fn is_existing(&self) -> bool {
        self.full_path().exists()
    }

    /// Whether another hard link may be pointed at this archive file:
    /// small files are excluded from linking entirely, and the per-inode
    /// link ceiling must not be reached.
    pub fn is_linkable(&self) -> bool {
        self.linkable_under(MAX_HARD_LINK_COUNT)
    }

    pub(crate) fn linkable_under(&self, ceiling: u64) -> bool {
        match self.size {
            Some(size) if size >= HARD_LINK_MIN_BYTES => {}
            _ => return true,
        }

        match hard_link_count(&self.full_path()) {
            Ok(count) if count >= ceiling => {
                log::debug!("hard link limit reached: {}", self);
                false
            }
            Ok(_) => true,
            Err(e) => {
                log::warn!("cannot get hard link count: {}: {}", self, e);
                false
            }
        }
    }

    /// Fill `size` and `time` from the source file. Returns `false` when
    /// the source cannot be read.
    pub fn read_source_properties(&mut self) -> bool {
        let metadata = match fs::metadata(&self.source_path) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("cannot read properties: {}: {}", self.source_path.display(), e);
                return false;
            }
        };
        self.size = Some(metadata.len());
        self.time = Some(Timestamp::from_file_time(
            filetime::FileTime::from_last_modification_time(&metadata),
        ));
        true
    }

    /// Take a shared read lock on the source, retrying for up to
    /// 10 × 10 ms. The lock is held until [`unlock_source`](Self::unlock_source)
    /// or drop, keeping writers out while the file is hashed and archived.
    pub fn lock_source(&mut self) -> bool {
        if self.source_lock.is_some() {
            return true;
        }

        for attempt in 0..LOCK_RETRIES {
            if let Ok(file) = File::open(&self.source_path) {
                if file.try_lock_shared().is_ok() {
                    self.source_lock = Some(Rc::new(file));
                    return true;
                }
            }
            if attempt + 1 < LOCK_RETRIES {
                thread::sleep(LOCK_RETRY_DELAY);
            }
        }
        false
    }

    pub fn unlock_source(&mut self) {
        self.source_lock = None;
    }

    pub fn is_source_locked(&self) -> bool {
        self.source_lock.is_some()
    }

    /// Hash the source content through the held lock, acquiring it first if
    /// necessary. Fills `hash` and counts the hashed bytes.
    pub fn hash_source(&mut self, stats: &Stats) -> bool {
        if !self.lock_source() {
            return false;
        }

        let Some(lock) = self.source_lock.clone() else {
            return false;
        };
        let mut reader = lock.as_ref();
        if let Err(e) = reader.seek(SeekFrom::Start(0)) {
            log::warn!("cannot rewind source: {}: {}", self.source_path.display(), e);
            return false;
        }

        match hash_stream(&mut reader) {
            Ok(hash) => {
                self.hash = hash;
                stats.add_hashed(self.size.unwrap_or(0));
                true
            }
            Err(e) => {
                log::warn!("cannot hash source: {}: {}", self.source_path.display(), e);
                false
            }
        }
    }

    /// Hash the archive file itself (used by verify's rehash pass).
    pub fn hash_archive(&mut self, stats: &Stats) -> bool {
        let mut file = match File::open(self.full_path()) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("cannot open archive: {}: {}", self, e);
                return false;
            }
        };

        match hash_stream(&mut file) {
            Ok(hash) => {
                self.hash = hash;
                stats.add_hashed(self.size.unwrap_or(0));
                true
            }
            Err(e) => {
                log::warn!("cannot hash archive: {}: {}", self, e);
                false
            }
        }
    }

    /// Copy `source` to this file's archive location, creating parent
    /// directories and preserving the modification time.
    pub fn copy_from(&self, source: &Path, stats: &Stats) -> bool {
        let full_path = self.full_path();
        fsutil::check_path_length(&full_path);

        if let Some(parent) = full_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::warn!("cannot create directory: {}: {}", parent.display(), e);
                return false;
            }
        }

        if let Err(e) = fs::copy(source, &full_path) {
            log::warn!("cannot copy: {} from: {}: {}", self, source.display(), e);
            return false;
        }

        stats.add_copied(self.size.unwrap_or(0));
        log::debug!("copied: {} from: {}", self, source.display());

        if let Some(time) = self.time {
            if let Err(e) = filetime::set_file_mtime(&full_path, time.to_file_time()) {
                log::warn!("cannot set modification time: {}: {}", self, e);
            }
        }

        true
    }

    /// Hard-link `source` to this file's archive location. Files below
    /// [`HARD_LINK_MIN_BYTES`] are copied instead.
    pub fn link_from(&self, source: &Path, stats: &Stats) -> bool {
        if self.size.unwrap_or(0) < HARD_LINK_MIN_BYTES {
            return self.copy_from(source, stats);
        }

        let full_path = self.full_path();
        fsutil::check_path_length(&full_path);

        if let Some(parent) = full_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::warn!("cannot create directory: {}: {}", parent.display(), e);
                return false;
            }
        }

        if let Err(e) = fs::hard_link(source, &full_path) {
            log::warn!("cannot link: {} from: {}: {}", self, source.display(), e);
            return false;
        }

        stats.add_linked(self.size.unwrap_or(0));
        log::debug!("linked: {} from: {}", self, source.display());

        true
    }

    /// Remove the archive file, restoring write permission first if needed.
    pub fn delete(&self, stats: &Stats) -> bool {
        let full_path = self.full_path();
        fsutil::make_writable(&full_path);

        if let Err(e) = fs::remove_file(&full_path) {
            log::warn!("cannot delete: {}: {}", self, e);
            return false;
        }

        stats.add_deleted(self.size.unwrap_or(0));
        log::debug!("deleted: {}", self);

        true
    }

    /// Filesystem identity of the archive's content: the inode number.
    /// All hard links to the same content share it. `None` when the file
    /// cannot be inspected or the platform exposes no such identity.
    pub fn file_system_index(&self) -> Option<u64> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            fs::metadata(self.full_path()).ok().map(|m| m.ino())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    /// Source-side rendering for log lines about the file being backed up.
    pub fn source_display(&self) -> String {
        format!(
            "{} {} {}",
            self.format_size(),
            self.format_time(),
            self.source_path.display()
        )
    }

    fn format_size(&self) -> String {
        match self.size {
            Some(size) => fsutil::group_digits(size, 15),
            None => " ".repeat(15),
        }
    }

    fn format_time(&self) -> String {
        match self.time {
            Some(time) => fsutil::format_timestamp(time.to_system_time()),
            None => " ".repeat(fsutil::TIMESTAMP_LEN),
        }
    }
}

impl fmt::Display for RepoFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.format_size(),
            self.format_time(),
            self.full_path().display()
        )
    }
}

/// Stream a reader through SHA-256, yielding lowercase hex.
fn hash_stream<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hard_link_count(path: &Path) -> io::Result<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok(fs::metadata(path)?.nlink())
    }
    #[cfg(not(unix))]
    {
        // No portable link count here; report a single link so the size
        // threshold and the link syscall's own errors govern behavior.
        fs::metadata(path).map(|_| 1)
    }
}
