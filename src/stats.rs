//! Counters describing what happened to buffered data

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage counters shared by the folder manager and the storage handles
#[derive(Debug, Default)]
pub struct StorageStats {
    records_written: AtomicU64,
    records_read: AtomicU64,
    records_removed: AtomicU64,
    files_created: AtomicU64,
    files_expired: AtomicU64,
    files_evicted: AtomicU64,
    read_retries: AtomicU64,
    write_retries: AtomicU64,
}

impl StorageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.records_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removed(&self) {
        self.records_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn file_created(&self) {
        self.files_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn file_expired(&self) {
        self.files_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn file_evicted(&self) {
        self.files_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn read_retry(&self) {
        self.read_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            records_written: self.records_written.load(Ordering::Relaxed),
            records_read: self.records_read.load(Ordering::Relaxed),
            records_removed: self.records_removed.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            files_expired: self.files_expired.load(Ordering::Relaxed),
            files_evicted: self.files_evicted.load(Ordering::Relaxed),
            read_retries: self.read_retries.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StorageStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStatsSnapshot {
    pub records_written: u64,
    pub records_read: u64,
    pub records_removed: u64,
    pub files_created: u64,
    pub files_expired: u64,
    pub files_evicted: u64,
    pub read_retries: u64,
    pub write_retries: u64,
}
