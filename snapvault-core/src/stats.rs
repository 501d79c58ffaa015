//! Per-session transfer counters.
//!
//! One [`Stats`] value is created per command invocation and passed by
//! reference into the engine. The engine is single-threaded, so plain `Cell`
//! counters suffice.

use std::cell::Cell;

use serde::Serialize;

/// File and byte counters for one command session.
#[derive(Debug, Default)]
pub struct Stats {
    files_hashed: Cell<u64>,
    files_copied: Cell<u64>,
    files_linked: Cell<u64>,
    files_deleted: Cell<u64>,
    bytes_hashed: Cell<u64>,
    bytes_copied: Cell<u64>,
    bytes_linked: Cell<u64>,
    bytes_deleted: Cell<u64>,
}

/// A plain snapshot of the counters, for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub files_hashed: u64,
    pub files_copied: u64,
    pub files_linked: u64,
    pub files_deleted: u64,
    pub bytes_hashed: u64,
    pub bytes_copied: u64,
    pub bytes_linked: u64,
    pub bytes_deleted: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hashed(&self, bytes: u64) {
        self.files_hashed.set(self.files_hashed.get() + 1);
        self.bytes_hashed.set(self.bytes_hashed.get() + bytes);
    }

    pub fn add_copied(&self, bytes: u64) {
        self.files_copied.set(self.files_copied.get() + 1);
        self.bytes_copied.set(self.bytes_copied.get() + bytes);
    }

    pub fn add_linked(&self, bytes: u64) {
        self.files_linked.set(self.files_linked.get() + 1);
        self.bytes_linked.set(self.bytes_linked.get() + bytes);
    }

    pub fn add_deleted(&self, bytes: u64) {
        self.files_deleted.set(self.files_deleted.get() + 1);
        self.bytes_deleted.set(self.bytes_deleted.get() + bytes);
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            files_hashed: self.files_hashed.get(),
            files_copied: self.files_copied.get(),
            files_linked: self.files_linked.get(),
            files_deleted: self.files_deleted.get(),
            bytes_hashed: self.bytes_hashed.get(),
            bytes_copied: self.bytes_copied.get(),
            bytes_linked: self.bytes_linked.get(),
            bytes_deleted: self.bytes_deleted.get(),
        }
    }
}
