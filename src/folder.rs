//! Per-signal folder management: file selection, expiry and eviction

use crate::buffer_file::{HandleToken, ReadableFile, WritableFile};
use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::errors::{BufferError, Result};
use crate::stats::StorageStats;

use serde::Serialize;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A buffer file as seen on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferFileInfo {
    /// Creation time in epoch milliseconds, taken from the file name
    pub name: u64,
    pub path: PathBuf,
    pub size: u64,
    pub age_ms: u64,
}

/// Handles most recently given out, tracked so that eviction and expiry can
/// close them.
#[derive(Debug, Default)]
struct HandedOut {
    writable: Option<HandleToken>,
    readable: Option<HandleToken>,
}

impl HandedOut {
    fn close_if_matches(&self, name: u64) {
        for token in [&self.writable, &self.readable].into_iter().flatten() {
            if token.name == name {
                token.close();
            }
        }
    }
}

/// Owns one signal folder and decides which file is written and which is read.
///
/// Every operation holds the folder lock for the whole list-then-mutate
/// sequence.
#[derive(Debug)]
pub struct FolderManager {
    folder: PathBuf,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    handed_out: Mutex<HandedOut>,
    stats: Arc<StorageStats>,
}

impl FolderManager {
    pub fn new(
        folder: PathBuf,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<StorageStats>,
    ) -> Self {
        Self {
            folder,
            config,
            clock,
            handed_out: Mutex::new(HandedOut::default()),
            stats,
        }
    }

    /// Create the manager for `root_dir/folder_name`, creating the folder if
    /// it does not exist yet.
    pub async fn create(
        root_dir: &Path,
        folder_name: &str,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<StorageStats>,
    ) -> Result<Self> {
        let folder = root_dir.join(folder_name);
        tokio::fs::create_dir_all(&folder).await.map_err(|err| {
            BufferError::Io(std::io::Error::new(
                err.kind(),
                format!(
                    "could not create the signal folder '{}' inside {}: {}",
                    folder_name,
                    root_dir.display(),
                    err
                ),
            ))
        })?;

        Ok(Self::new(folder, config, clock, stats))
    }

    /// List the buffer files of `root_dir/folder_name` without creating the
    /// folder. A folder that does not exist holds no files.
    pub async fn inspect(
        root_dir: &Path,
        folder_name: &str,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Vec<BufferFileInfo>> {
        let folder = root_dir.join(folder_name);
        if !tokio::fs::try_exists(&folder).await? {
            return Ok(Vec::new());
        }

        Self::new(folder, config, clock, Arc::new(StorageStats::new()))
            .snapshot()
            .await
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Get a file to append to.
    ///
    /// A file still inside its write window is reused, unless it is the file
    /// this manager handed out last and that handle has been closed since.
    /// Otherwise expired files are purged, the oldest files are evicted until
    /// a new full-size file fits in the folder, and a new file is created.
    pub async fn create_writable_file(&self) -> Result<WritableFile> {
        let mut handed_out = self.handed_out.lock().await;
        let now = self.clock.now_millis();
        let files = self.list_files().await?;

        if let Some(newest) = files.last() {
            let within_window =
                now.saturating_sub(newest.name) < self.config.max_file_age_for_write_ms;
            let retired = handed_out
                .writable
                .as_ref()
                .is_some_and(|token| token.name == newest.name && token.is_closed());

            if within_window && !retired {
                debug!("Reusing buffer file {}", newest.path.display());
                let file = WritableFile::open(
                    newest.path.clone(),
                    newest.name,
                    &self.config,
                    Arc::clone(&self.clock),
                )
                .await?;
                handed_out.writable = Some(file.token());
                return Ok(file);
            }
        }

        let next_name = files
            .last()
            .map_or(now, |newest| now.max(newest.name.saturating_add(1)));

        let mut remaining = self.purge_expired(&handed_out, files, now).await?;
        self.evict_for_new_file(&handed_out, &mut remaining).await?;

        let path = self.folder.join(next_name.to_string());
        let file =
            WritableFile::open(path, next_name, &self.config, Arc::clone(&self.clock)).await?;

        info!("Created buffer file {}", file.path().display());
        self.stats.file_created();
        handed_out.writable = Some(file.token());

        Ok(file)
    }

    /// Get the oldest file that is old enough to read, purging files that
    /// are too old to read first.
    pub async fn get_readable_file(&self) -> Result<Option<ReadableFile>> {
        self.get_readable_file_excluding(&HashSet::new()).await
    }

    /// Same as [`get_readable_file`](Self::get_readable_file), skipping the
    /// files named in `excluded`.
    pub async fn get_readable_file_excluding(
        &self,
        excluded: &HashSet<u64>,
    ) -> Result<Option<ReadableFile>> {
        let mut handed_out = self.handed_out.lock().await;
        let now = self.clock.now_millis();
        let files = self.list_files().await?;
        let remaining = self.purge_expired(&handed_out, files, now).await?;

        let candidate = remaining.into_iter().find(|file| {
            !excluded.contains(&file.name)
                && now >= file.name.saturating_add(self.config.min_file_age_for_read_ms)
        });

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        if let Some(writable) = handed_out.writable.as_ref() {
            if writable.name == candidate.name {
                debug!(
                    "Closing writable handle on {} before reading it",
                    candidate.path.display()
                );
                writable.close();
            }
        }

        let file = ReadableFile::open(
            candidate.path,
            candidate.name,
            &self.config,
            Arc::clone(&self.clock),
        )
        .await?;
        handed_out.readable = Some(file.token());

        Ok(Some(file))
    }

    /// Close every handle this manager gave out
    pub async fn close_handles(&self) {
        let handed_out = self.handed_out.lock().await;
        for token in [&handed_out.writable, &handed_out.readable].into_iter().flatten() {
            token.close();
        }
    }

    /// Delete every buffer file in the folder
    pub async fn clear(&self) -> Result<usize> {
        let handed_out = self.handed_out.lock().await;
        let files = self.list_files().await?;
        let mut deleted = 0;

        for file in files {
            handed_out.close_if_matches(file.name);
            if remove_if_present(&file.path).await? {
                deleted += 1;
            }
        }

        info!("Cleared {} buffer files from {}", deleted, self.folder.display());
        Ok(deleted)
    }

    /// List the buffer files currently in the folder, oldest first
    pub async fn snapshot(&self) -> Result<Vec<BufferFileInfo>> {
        let _handed_out = self.handed_out.lock().await;
        let now = self.clock.now_millis();
        let files = self.list_files().await?;

        Ok(files
            .into_iter()
            .map(|file| BufferFileInfo {
                age_ms: now.saturating_sub(file.name),
                name: file.name,
                path: file.path,
                size: file.size,
            })
            .collect())
    }

    async fn purge_expired(
        &self,
        handed_out: &HandedOut,
        files: Vec<DiskFile>,
        now: u64,
    ) -> Result<Vec<DiskFile>> {
        let mut remaining = Vec::with_capacity(files.len());

        for file in files {
            let expired =
                now >= file.name.saturating_add(self.config.max_file_age_for_read_ms);
            if !expired {
                remaining.push(file);
                continue;
            }

            handed_out.close_if_matches(file.name);
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => {
                    info!(
                        "Deleted buffer file {} after its read window expired ({} bytes lost)",
                        file.path.display(),
                        file.size
                    );
                    self.stats.file_expired();
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("Could not delete expired buffer file {}: {}", file.path.display(), err);
                    remaining.push(file);
                }
            }
        }

        Ok(remaining)
    }

    async fn evict_for_new_file(
        &self,
        handed_out: &HandedOut,
        remaining: &mut Vec<DiskFile>,
    ) -> Result<()> {
        let mut folder_size: u64 = remaining.iter().map(|file| file.size).sum();

        while !remaining.is_empty()
            && folder_size + self.config.max_file_size > self.config.max_folder_size
        {
            let oldest = remaining.remove(0);
            handed_out.close_if_matches(oldest.name);

            warn!(
                "Evicting buffer file {} ({} bytes) to stay under {} bytes",
                oldest.path.display(),
                oldest.size,
                self.config.max_folder_size
            );

            tokio::fs::remove_file(&oldest.path).await.map_err(|err| {
                BufferError::Io(std::io::Error::new(
                    err.kind(),
                    format!("could not delete the file {}: {}", oldest.path.display(), err),
                ))
            })?;

            self.stats.file_evicted();
            folder_size -= oldest.size;
        }

        Ok(())
    }

    /// Buffer files in the folder ordered by name. Entries whose name is not a
    /// timestamp are left alone.
    async fn list_files(&self) -> Result<Vec<DiskFile>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.folder).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|name| name.parse::<u64>().ok()) else {
                warn!(
                    "Skipping foreign entry {} in buffer folder",
                    entry.path().display()
                );
                continue;
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            if !metadata.is_file() {
                warn!("Skipping non-file entry {} in buffer folder", entry.path().display());
                continue;
            }

            files.push(DiskFile {
                name,
                path: entry.path(),
                size: metadata.len(),
            });
        }

        files.sort_by_key(|file| file.name);
        Ok(files)
    }
}

#[derive(Debug, Clone)]
struct DiskFile {
    name: u64,
    path: PathBuf,
    size: u64,
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MAX_FILE_AGE_FOR_WRITE_MS: u64 = 1000;
    const MIN_FILE_AGE_FOR_READ_MS: u64 = MAX_FILE_AGE_FOR_WRITE_MS + 500;
    const MAX_FILE_AGE_FOR_READ_MS: u64 = 10_000;
    const MAX_FILE_SIZE: u64 = 100;
    const MAX_FOLDER_SIZE: u64 = 300;

    fn config() -> StorageConfig {
        StorageConfig {
            max_file_size: MAX_FILE_SIZE,
            max_folder_size: MAX_FOLDER_SIZE,
            min_file_age_for_read_ms: MIN_FILE_AGE_FOR_READ_MS,
            max_file_age_for_read_ms: MAX_FILE_AGE_FOR_READ_MS,
            max_file_age_for_write_ms: MAX_FILE_AGE_FOR_WRITE_MS,
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        manager: FolderManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        let manager = FolderManager::new(
            dir.path().to_path_buf(),
            config(),
            clock.clone(),
            Arc::new(StorageStats::new()),
        );
        Fixture { dir, clock, manager }
    }

    async fn create_file(dir: &Path, name: u64, size: usize) -> PathBuf {
        let path = dir.join(name.to_string());
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_writable_file_named_after_current_time() {
        let fx = fixture();

        let file = fx.manager.create_writable_file().await.unwrap();

        assert_eq!(file.name(), 1000);
        assert_eq!(file.path(), fx.dir.path().join("1000"));
    }

    #[tokio::test]
    async fn test_reuses_file_inside_write_window() {
        let fx = fixture();
        create_file(fx.dir.path(), 900, 10).await;

        let file = fx.manager.create_writable_file().await.unwrap();

        assert_eq!(file.name(), 900);
        assert_eq!(file.size(), 10);
    }

    #[tokio::test]
    async fn test_does_not_reuse_closed_writable_file() {
        let fx = fixture();

        let mut first = fx.manager.create_writable_file().await.unwrap();
        first.close();

        let second = fx.manager.create_writable_file().await.unwrap();
        assert!(second.name() > first.name());
        assert_eq!(second.name(), 1001);
    }

    #[tokio::test]
    async fn test_evicts_oldest_file_when_folder_is_full() {
        let fx = fixture();
        fx.clock.set(5000);
        let oldest = create_file(fx.dir.path(), 1000, 100).await;
        let middle = create_file(fx.dir.path(), 1100, 100).await;
        let newest = create_file(fx.dir.path(), 1200, 100).await;

        let file = fx.manager.create_writable_file().await.unwrap();

        assert_eq!(file.name(), 5000);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
        assert_eq!(fx.manager.stats.snapshot().files_evicted, 1);
    }

    #[tokio::test]
    async fn test_purges_expired_files_when_creating_new_one() {
        let fx = fixture();
        let expired = create_file(fx.dir.path(), 1000, 10).await;
        fx.clock.set(1000 + MAX_FILE_AGE_FOR_READ_MS + 1);
        let recent = create_file(fx.dir.path(), 1000 + MAX_FILE_AGE_FOR_READ_MS - 2000, 10).await;

        let file = fx.manager.create_writable_file().await.unwrap();

        assert!(!expired.exists());
        assert!(recent.exists());
        assert_ne!(file.path(), recent.as_path());
        assert_eq!(fx.manager.stats.snapshot().files_expired, 1);
    }

    #[tokio::test]
    async fn test_eviction_closes_file_being_read() {
        let fx = fixture();
        create_file(fx.dir.path(), 1000, 100).await;
        create_file(fx.dir.path(), 1100, 100).await;
        create_file(fx.dir.path(), 1200, 100).await;
        fx.clock.set(1000 + MIN_FILE_AGE_FOR_READ_MS);

        let readable = fx.manager.get_readable_file().await.unwrap().unwrap();
        assert_eq!(readable.name(), 1000);

        fx.manager.create_writable_file().await.unwrap();

        assert!(readable.is_closed());
        assert!(!fx.dir.path().join("1000").exists());
    }

    #[tokio::test]
    async fn test_readable_only_after_min_age() {
        let fx = fixture();
        create_file(fx.dir.path(), 1000, 0).await;

        fx.clock.set(1000 + MIN_FILE_AGE_FOR_READ_MS - 1);
        assert!(fx.manager.get_readable_file().await.unwrap().is_none());

        fx.clock.set(1000 + MIN_FILE_AGE_FOR_READ_MS);
        let file = fx.manager.get_readable_file().await.unwrap().unwrap();
        assert_eq!(file.name(), 1000);
    }

    #[tokio::test]
    async fn test_oldest_readable_file_is_chosen() {
        let fx = fixture();
        create_file(fx.dir.path(), 1200, 0).await;
        create_file(fx.dir.path(), 1000, 0).await;
        create_file(fx.dir.path(), 1100, 0).await;
        fx.clock.set(5000);

        let file = fx.manager.get_readable_file().await.unwrap().unwrap();
        assert_eq!(file.name(), 1000);

        let excluded: HashSet<u64> = [1000].into_iter().collect();
        let file = fx
            .manager
            .get_readable_file_excluding(&excluded)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.name(), 1100);
    }

    #[tokio::test]
    async fn test_no_readable_file_when_folder_empty_or_too_young() {
        let fx = fixture();
        assert!(fx.manager.get_readable_file().await.unwrap().is_none());

        fx.manager.create_writable_file().await.unwrap();
        assert!(fx.manager.get_readable_file().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_files_are_purged_instead_of_read() {
        let fx = fixture();
        let path = create_file(fx.dir.path(), 1000, 10).await;
        fx.clock.set(1000 + MAX_FILE_AGE_FOR_READ_MS + 1);

        assert!(fx.manager.get_readable_file().await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_expires_at_exact_read_window_end() {
        let fx = fixture();
        let path = create_file(fx.dir.path(), 1000, 10).await;

        fx.clock.set(1000 + MAX_FILE_AGE_FOR_READ_MS - 1);
        let file = fx.manager.get_readable_file().await.unwrap().unwrap();
        assert!(!file.has_expired());
        drop(file);

        fx.clock.set(1000 + MAX_FILE_AGE_FOR_READ_MS);
        assert!(fx.manager.get_readable_file().await.unwrap().is_none());
        assert!(!path.exists());
        assert_eq!(fx.manager.stats.snapshot().files_expired, 1);
    }

    #[tokio::test]
    async fn test_inspect_does_not_create_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(5000));

        let files = FolderManager::inspect(dir.path(), "metrics", config(), clock.clone())
            .await
            .unwrap();
        assert!(files.is_empty());
        assert!(!dir.path().join("metrics").exists());

        tokio::fs::create_dir(dir.path().join("metrics")).await.unwrap();
        create_file(&dir.path().join("metrics"), 1000, 10).await;
        let files = FolderManager::inspect(dir.path(), "metrics", config(), clock)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, 1000);
        assert_eq!(files[0].age_ms, 4000);
    }

    #[tokio::test]
    async fn test_reading_the_writable_file_closes_it() {
        let fx = fixture();
        let writable = fx.manager.create_writable_file().await.unwrap();
        fx.clock.advance(MIN_FILE_AGE_FOR_READ_MS);

        let readable = fx.manager.get_readable_file().await.unwrap().unwrap();

        assert_eq!(readable.name(), writable.name());
        assert!(writable.is_closed());
    }

    #[tokio::test]
    async fn test_foreign_entries_are_skipped() {
        let fx = fixture();
        tokio::fs::write(fx.dir.path().join("notes.txt"), b"hello").await.unwrap();
        tokio::fs::create_dir(fx.dir.path().join("123")).await.unwrap();
        create_file(fx.dir.path(), 1000, 0).await;
        fx.clock.set(5000);

        let file = fx.manager.get_readable_file().await.unwrap().unwrap();
        assert_eq!(file.name(), 1000);

        let snapshot = fx.manager.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(fx.dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_clear_removes_buffer_files() {
        let fx = fixture();
        create_file(fx.dir.path(), 1000, 10).await;
        create_file(fx.dir.path(), 1100, 10).await;

        assert_eq!(fx.manager.clear().await.unwrap(), 2);
        assert!(fx.manager.snapshot().await.unwrap().is_empty());
    }
}
