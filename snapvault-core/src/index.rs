//! The per-snapshot file index.
//!
//! A small SQLite store with a single table:
//!
//! ```text
//! FILES(SOURCE text, SIZE int, TIME int, HASH text, FILE text)
//!   unique index on (SOURCE, SIZE, TIME, HASH, FILE)
//!   secondary index on (HASH)
//! ```
//!
//! Queries are built from a [`RepoFile`] used as a constraint pattern: every
//! specified field contributes one `WHERE` term, bound as a parameter. The
//! store is tuned for a single writer: exclusive locking, journal and
//! synchronous off, large cache.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{Connection, Row};

use crate::error::{Result, VaultError};
use crate::repo_file::RepoFile;
use crate::units::Timestamp;

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS FILES (\
        SOURCE TEXT NOT NULL, \
        SIZE INTEGER NOT NULL, \
        TIME INTEGER NOT NULL, \
        HASH TEXT NOT NULL, \
        FILE TEXT NOT NULL\
    );\
    CREATE UNIQUE INDEX IF NOT EXISTS FILES_SOURCE_SIZE_TIME_HASH_FILE \
        ON FILES (SOURCE, SIZE, TIME, HASH, FILE);\
    CREATE INDEX IF NOT EXISTS FILES_HASH ON FILES (HASH);";

/// Handle to one snapshot's index store.
pub struct SnapshotIndex {
    conn: Connection,
    path: PathBuf,
}

impl SnapshotIndex {
    /// Open (and initialize, if empty) the index at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "locking_mode", "exclusive")?;
        conn.pragma_update(None, "cache_size", 1_000_000)?;
        conn.pragma_update(None, "synchronous", "off")?;
        conn.pragma_update(None, "secure_delete", "off")?;
        conn.pragma_update(None, "journal_mode", "off")?;
        conn.execute_batch(SCHEMA)?;
        Ok(SnapshotIndex {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stream matching rows and return the chosen one.
    ///
    /// With `prefer_linkable` the first linkable match wins and the last
    /// match is the fallback (the caller may still copy from it); otherwise
    /// the first match wins.
    pub fn find_file(
        &self,
        constraints: &RepoFile,
        parent: &Path,
        prefer_linkable: bool,
    ) -> Result<Option<RepoFile>> {
        let (where_sql, params) = build_constraints(constraints);
        let sql = format!("SELECT SOURCE, SIZE, TIME, HASH, FILE FROM FILES{}", where_sql);

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

        let mut fallback = None;
        while let Some(row) = rows.next()? {
            let file = row_to_file(row, parent)?;
            if !prefer_linkable || file.is_linkable() {
                return Ok(Some(file));
            }
            fallback = Some(file);
        }
        Ok(fallback)
    }

    /// All matching rows, with `parent` re-attached so `full_path` is usable.
    pub fn find_all(&self, constraints: &RepoFile, parent: &Path) -> Result<Vec<RepoFile>> {
        let (where_sql, params) = build_constraints(constraints);
        let sql = format!("SELECT SOURCE, SIZE, TIME, HASH, FILE FROM FILES{}", where_sql);

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

        let mut files = Vec::new();
        while let Some(row) = rows.next()? {
            files.push(row_to_file(row, parent)?);
        }
        Ok(files)
    }

    /// Insert a fully specified file. Partially specified files are a
    /// programmer error.
    pub fn insert(&self, file: &RepoFile) -> Result<()> {
        let size = file
            .size
            .ok_or_else(|| VaultError::Invariant(format!("insert without size: {}", file)))?;
        let time = file
            .time
            .ok_or_else(|| VaultError::Invariant(format!("insert without time: {}", file)))?;
        if !file.has_hash() {
            return Err(VaultError::Invariant(format!("insert without hash: {}", file)));
        }
        if file.source_path.as_os_str().is_empty() || file.relative_path.as_os_str().is_empty() {
            return Err(VaultError::Invariant(format!("insert without paths: {}", file)));
        }

        self.conn.execute(
            "INSERT INTO FILES (SOURCE, SIZE, TIME, HASH, FILE) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                path_to_text(&file.source_path),
                size as i64,
                time.as_nanos(),
                file.hash,
                path_to_text(&file.relative_path),
            ],
        )?;
        Ok(())
    }

    /// Delete all rows matching the constraint pattern; returns the count.
    pub fn delete(&self, constraints: &RepoFile) -> Result<usize> {
        let (where_sql, params) = build_constraints(constraints);
        let sql = format!("DELETE FROM FILES{}", where_sql);
        Ok(self
            .conn
            .execute(&sql, rusqlite::params_from_iter(params))?)
    }

    /// `true` iff the store reports "ok".
    pub fn check_integrity(&self) -> Result<bool> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    /// Rewrite the store, reclaiming space.
    pub fn compact(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Close the connection, surfacing any deferred error.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| VaultError::Index(e))
    }
}

/// Translate a constraint pattern into a `WHERE` conjunction over the
/// specified fields, with bound parameters.
fn build_constraints(constraints: &RepoFile) -> (String, Vec<Value>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if !constraints.source_path.as_os_str().is_empty() {
        clauses.push("SOURCE = ?");
        params.push(Value::Text(path_to_text(&constraints.source_path)));
    }
    if let Some(size) = constraints.size {
        clauses.push("SIZE = ?");
        params.push(Value::Integer(size as i64));
    }
    if let Some(time) = constraints.time {
        clauses.push("TIME = ?");
        params.push(Value::Integer(time.as_nanos()));
    }
    if constraints.has_hash() {
        clauses.push("HASH = ?");
        params.push(Value::Text(constraints.hash.clone()));
    }
    if !constraints.relative_path.as_os_str().is_empty() {
        clauses.push("FILE = ?");
        params.push(Value::Text(path_to_text(&constraints.relative_path)));
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

fn row_to_file(row: &Row<'_>, parent: &Path) -> Result<RepoFile> {
    let source: String = row.get(0)?;
    let size: i64 = row.get(1)?;
    let time: i64 = row.get(2)?;
    let hash: String = row.get(3)?;
    let relative: String = row.get(4)?;

    Ok(RepoFile {
        source_path: PathBuf::from(source),
        size: Some(size as u64),
        time: Some(Timestamp::from_nanos(time)),
        hash,
        relative_path: PathBuf::from(relative),
        parent_path: parent.to_path_buf(),
        ..Default::default()
    })
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
