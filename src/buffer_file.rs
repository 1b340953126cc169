//! Length-framed buffer files
//!
//! Every file in a signal folder is named after its creation time in epoch
//! milliseconds and holds a sequence of records, each framed as a 4-byte
//! little-endian payload length followed by the payload.

use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::errors::{BufferError, FileError, Result};

use std::collections::VecDeque;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Size of the length prefix in front of each record
pub const FRAME_HEADER_LEN: u64 = 4;

/// What the consumer of a record decided to do with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Handled; the record can be removed
    Succeeded,
    /// Not handled; keep the record for a later attempt
    TryLater,
    /// The record can never be handled and should be dropped
    ContentInvalid,
}

/// Close flag shared between a file handle and the folder manager that
/// handed it out, so eviction can invalidate handles it does not own.
#[derive(Debug, Clone)]
pub(crate) struct HandleToken {
    pub(crate) name: u64,
    closed: Arc<AtomicBool>,
}

impl HandleToken {
    fn new(name: u64) -> Self {
        Self {
            name,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Encode one record
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| FileError::SizeExceeded)?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split file content into records.
///
/// Returns the complete records and the number of trailing bytes that did not
/// form a complete frame.
pub fn decode_frames(content: &[u8]) -> (Vec<Vec<u8>>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let header = FRAME_HEADER_LEN as usize;

    while offset + header <= content.len() {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&content[offset..offset + header]);
        let payload_len = u32::from_le_bytes(len_buf) as usize;
        let start = offset + header;
        let end = match start.checked_add(payload_len) {
            Some(end) if end <= content.len() => end,
            _ => break,
        };
        records.push(content[start..end].to_vec());
        offset = end;
    }

    (records, content.len() - offset)
}

/// The file currently accepting appends
#[derive(Debug)]
pub struct WritableFile {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    expire_at: u64,
    max_file_size: u64,
    clock: Arc<dyn Clock>,
    token: HandleToken,
}

impl WritableFile {
    /// Open (or create) the file for appending.
    ///
    /// `created_at` is the creation time encoded in the file name; an existing
    /// file keeps its current length.
    pub(crate) async fn open(
        path: PathBuf,
        created_at: u64,
        config: &StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();

        debug!("Opened writable buffer file {} ({} bytes)", path.display(), size);

        Ok(Self {
            path,
            file: Some(file),
            size,
            expire_at: created_at + config.max_file_age_for_write_ms,
            max_file_size: config.max_file_size,
            clock,
            token: HandleToken::new(created_at),
        })
    }

    /// Append one record.
    ///
    /// Either the whole frame lands on disk or the file is truncated back to
    /// its previous length and an error is returned.
    pub async fn append(&mut self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(FileError::Closed.into());
        }

        if self.has_expired() {
            debug!("Buffer file {} expired for writing", self.path.display());
            self.close();
            return Err(FileError::Expired.into());
        }

        let frame_len = FRAME_HEADER_LEN + payload.len() as u64;
        if self.size + frame_len > self.max_file_size {
            debug!(
                "Buffer file {} is full ({} + {} > {})",
                self.path.display(),
                self.size,
                frame_len,
                self.max_file_size
            );
            self.close();
            return Err(FileError::SizeExceeded.into());
        }

        let frame = encode_frame(payload)?;
        let file = self.file.as_mut().ok_or(FileError::Closed)?;

        let written = async {
            file.write_all(&frame).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = written {
            roll_back(file, &self.path, self.size).await;
            self.close();
            return Err(append_error(err));
        }

        self.size += frame_len;
        Ok(())
    }

    pub fn has_expired(&self) -> bool {
        self.clock.now_millis() >= self.expire_at
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_closed()
    }

    pub fn close(&mut self) {
        self.token.close();
        self.file = None;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn name(&self) -> u64 {
        self.token.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn token(&self) -> HandleToken {
        self.token.clone()
    }
}

/// Truncate `file` back to `len` after an append failed part way.
async fn roll_back(file: &File, path: &Path, len: u64) {
    if let Err(err) = file.set_len(len).await {
        warn!("Could not roll back partial write in {}: {}", path.display(), err);
    }
}

fn append_error(err: std::io::Error) -> BufferError {
    if err.kind() == ErrorKind::StorageFull {
        FileError::NoSpace.into()
    } else {
        BufferError::Io(err)
    }
}

/// A read-eligible file being consumed record by record.
///
/// The content is loaded when the file is opened. Consumed records are removed
/// by rewriting the remainder back to disk; the file is deleted once nothing
/// is left in it.
#[derive(Debug)]
pub struct ReadableFile {
    path: PathBuf,
    pending: VecDeque<Vec<u8>>,
    retained: Vec<Vec<u8>>,
    handed_out: bool,
    expire_at: u64,
    clock: Arc<dyn Clock>,
    token: HandleToken,
}

impl ReadableFile {
    pub(crate) async fn open(
        path: PathBuf,
        created_at: u64,
        config: &StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let content = tokio::fs::read(&path).await?;
        let (records, trailing) = decode_frames(&content);

        if trailing > 0 {
            warn!(
                "Dropping {} trailing bytes of an incomplete record in {}",
                trailing,
                path.display()
            );
        }

        debug!(
            "Opened readable buffer file {} with {} records",
            path.display(),
            records.len()
        );

        Ok(Self {
            path,
            pending: records.into(),
            retained: Vec::new(),
            handed_out: false,
            expire_at: created_at + config.max_file_age_for_read_ms,
            clock,
            token: HandleToken::new(created_at),
        })
    }

    /// Read the next record and let `consumer` decide whether it is removed.
    pub async fn read<F, Fut>(&mut self, consumer: F) -> Result<ProcessResult>
    where
        F: FnOnce(Vec<u8>) -> Fut,
        Fut: Future<Output = ProcessResult>,
    {
        let record = self.read_next().await?;
        let result = consumer(record).await;
        self.settle(result).await?;
        Ok(result)
    }

    /// Hand out the record at the head of the file.
    ///
    /// A record handed out earlier and neither removed nor released is kept on
    /// disk and skipped.
    pub async fn read_next(&mut self) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(FileError::Closed.into());
        }

        if self.has_expired() {
            debug!("Buffer file {} expired for reading", self.path.display());
            self.close();
            return Err(FileError::Expired.into());
        }

        if self.handed_out {
            if let Some(record) = self.pending.pop_front() {
                self.retained.push(record);
            }
            self.handed_out = false;
        }

        match self.pending.front() {
            Some(record) => {
                self.handed_out = true;
                Ok(record.clone())
            }
            None => {
                self.finish().await?;
                Err(FileError::NoMoreRecords.into())
            }
        }
    }

    /// Apply a consumer's decision to the record last handed out.
    pub async fn settle(&mut self, result: ProcessResult) -> Result<()> {
        match result {
            ProcessResult::Succeeded | ProcessResult::ContentInvalid => self.remove().await,
            ProcessResult::TryLater => {
                self.handed_out = false;
                Ok(())
            }
        }
    }

    /// Delete the record last handed out from the backing file.
    pub async fn remove(&mut self) -> Result<()> {
        if !self.handed_out {
            return Err(BufferError::InvalidState(
                "next() must be called before remove()".to_string(),
            ));
        }

        if self.is_closed() {
            return Err(FileError::Closed.into());
        }

        self.pending.pop_front();
        self.handed_out = false;
        self.persist().await
    }

    pub fn has_retained(&self) -> bool {
        !self.retained.is_empty()
    }

    pub fn has_expired(&self) -> bool {
        self.clock.now_millis() >= self.expire_at
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_closed()
    }

    pub fn close(&mut self) {
        self.token.close();
        self.pending.clear();
        self.handed_out = false;
    }

    pub fn name(&self) -> u64 {
        self.token.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn token(&self) -> HandleToken {
        self.token.clone()
    }

    async fn persist(&mut self) -> Result<()> {
        if self.retained.is_empty() && self.pending.is_empty() {
            self.delete_backing_file().await?;
            self.close();
            return Ok(());
        }

        let mut content = Vec::new();
        for record in self.retained.iter().chain(self.pending.iter()) {
            content.extend_from_slice(&encode_frame(record)?);
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if self.retained.is_empty() {
            self.delete_backing_file().await?;
        }
        self.close();
        Ok(())
    }

    async fn delete_backing_file(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Deleted drained buffer file {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
