//! Storage: the write and read cursors over one signal folder

use crate::buffer_file::{ProcessResult, ReadableFile, WritableFile};
use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::errors::{BufferError, FileError, Result};
use crate::folder::{BufferFileInfo, FolderManager};
use crate::stats::{StorageStats, StorageStatsSnapshot};

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// A failed append means the current file rolled over, so one fresh file is
/// enough.
pub const MAX_WRITE_ATTEMPTS: u32 = 2;

/// Upper bound on fresh readable files tried within one read call.
pub const MAX_READ_ATTEMPTS: u32 = 10;

/// Result of a [`Storage::read`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No file is old enough to be read
    NoData,
    /// A record was handed to the consumer, which decided this
    Processed(ProcessResult),
}

/// Hides file rotation from writers and readers of one signal folder.
///
/// At most one writable and one readable file are open at any time. They sit
/// behind separate locks so that a slow consumer on the read side never holds
/// up writes.
#[derive(Debug)]
pub struct Storage {
    folder: FolderManager,
    writable: Mutex<Option<WritableFile>>,
    readable: Mutex<Option<ReadableFile>>,
    closed: AtomicBool,
    stats: Arc<StorageStats>,
}

impl Storage {
    pub fn new(folder: FolderManager, stats: Arc<StorageStats>) -> Self {
        Self {
            folder,
            writable: Mutex::new(None),
            readable: Mutex::new(None),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    /// Open storage over `root_dir/folder_name`, validating `config` first.
    pub async fn open(
        root_dir: &Path,
        folder_name: &str,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(StorageStats::new());
        let folder =
            FolderManager::create(root_dir, folder_name, config, clock, Arc::clone(&stats))
                .await?;
        Ok(Self::new(folder, stats))
    }

    /// Append one record to the current writable file, rolling over to a
    /// fresh file once if the current one can no longer take it.
    #[instrument(skip(self, record), fields(len = record.len()))]
    pub async fn write(&self, record: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut writable = self.writable.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.ensure_open()?;

            let file = match writable.take() {
                Some(file) => file,
                None => self.folder.create_writable_file().await?,
            };
            let file = writable.insert(file);

            match file.append(record).await {
                Ok(()) => {
                    self.stats.record_written();
                    return Ok(());
                }
                Err(BufferError::File(condition)) => {
                    *writable = None;
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        warn!(
                            "Could not append record after {} attempts: {}",
                            attempt, condition
                        );
                        return Err(BufferError::File(condition));
                    }
                    debug!("Append failed ({}), retrying with a fresh file", condition);
                    self.stats.write_retry();
                }
                Err(err) => {
                    *writable = None;
                    return Err(err);
                }
            }
        }
    }

    /// Read the next record and hand it to `consumer`.
    ///
    /// Records the consumer reports as `Succeeded` or `ContentInvalid` are
    /// removed from disk; `TryLater` leaves the record in place so the next
    /// read returns it again.
    #[instrument(skip(self, consumer))]
    pub async fn read<F, Fut>(&self, consumer: F) -> Result<ReadOutcome>
    where
        F: FnOnce(Vec<u8>) -> Fut,
        Fut: Future<Output = ProcessResult>,
    {
        self.ensure_open()?;
        let mut readable = self.readable.lock().await;

        let Some(record) = self.next_record(&mut readable, &mut HashSet::new()).await? else {
            return Ok(ReadOutcome::NoData);
        };

        let result = consumer(record).await;

        let file = readable.as_mut().ok_or(BufferError::Closed)?;
        if let Err(err) = file.settle(result).await {
            if self.is_closed() {
                return Err(BufferError::Closed);
            }
            return Err(err);
        }

        if result != ProcessResult::TryLater {
            self.stats.record_removed();
        }

        Ok(ReadOutcome::Processed(result))
    }

    /// Hand out the next record without deciding its fate.
    ///
    /// The record stays on disk unless [`remove_last`](Self::remove_last) is
    /// called before the next call to this method. Files whose records were
    /// all handed out but some kept are added to `excluded`, so they are not
    /// reopened by the same caller.
    pub async fn read_next_excluding(
        &self,
        excluded: &mut HashSet<u64>,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let mut readable = self.readable.lock().await;
        self.next_record(&mut readable, excluded).await
    }

    /// Delete the record last handed out by
    /// [`read_next_excluding`](Self::read_next_excluding).
    pub async fn remove_last(&self) -> Result<()> {
        self.ensure_open()?;
        let mut readable = self.readable.lock().await;
        let file = readable.as_mut().ok_or_else(|| {
            BufferError::InvalidState("next() must be called before remove()".to_string())
        })?;

        file.remove().await?;
        self.stats.record_removed();
        Ok(())
    }

    /// Forget the current readable file so the next read starts from the
    /// oldest readable file on disk again.
    pub async fn reset_read_cursor(&self) {
        if let Some(mut file) = self.readable.lock().await.take() {
            file.close();
        }
    }

    /// Close both cursors. Operations in flight or started later fail with
    /// a closed error. Calling this more than once has no further effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.folder.close_handles().await;

        if let Ok(mut writable) = self.writable.try_lock() {
            if let Some(mut file) = writable.take() {
                file.close();
            }
        }

        if let Ok(mut readable) = self.readable.try_lock() {
            if let Some(mut file) = readable.take() {
                file.close();
            }
        }

        debug!("Closed storage for {}", self.folder.folder().display());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn folder(&self) -> &FolderManager {
        &self.folder
    }

    pub fn stats(&self) -> StorageStatsSnapshot {
        self.stats.snapshot()
    }

    /// Buffer files currently on disk, oldest first
    pub async fn files(&self) -> Result<Vec<BufferFileInfo>> {
        self.folder.snapshot().await
    }

    async fn next_record(
        &self,
        readable: &mut Option<ReadableFile>,
        excluded: &mut HashSet<u64>,
    ) -> Result<Option<Vec<u8>>> {
        for attempt in 1..=MAX_READ_ATTEMPTS {
            self.ensure_open()?;

            let file = match readable.take() {
                Some(file) => file,
                None => match self.folder.get_readable_file_excluding(excluded).await? {
                    Some(file) => file,
                    None => return Ok(None),
                },
            };
            let file = readable.insert(file);

            match file.read_next().await {
                Ok(record) => {
                    self.stats.record_read();
                    return Ok(Some(record));
                }
                Err(BufferError::File(condition)) => {
                    if condition == FileError::NoMoreRecords && file.has_retained() {
                        excluded.insert(file.name());
                    }
                    debug!(
                        "Readable file {} unavailable ({}), attempt {}",
                        file.name(),
                        condition,
                        attempt
                    );
                    *readable = None;
                    self.stats.read_retry();
                }
                Err(err) => {
                    *readable = None;
                    return Err(err);
                }
            }
        }

        warn!("Giving up reading after {} attempts", MAX_READ_ATTEMPTS);
        Err(BufferError::MaxAttemptsReached(MAX_READ_ATTEMPTS))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BufferError::Closed);
        }
        Ok(())
    }
}
