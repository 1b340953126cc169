//! Buffered export queue: persist batches on export, forward them on drain

use crate::buffer_file::ProcessResult;
use crate::clock::{Clock, SystemClock};
use crate::codec::{Deserializer, ExportCallback, Forwarder, NoopCallback, Serializer};
use crate::config::StorageConfig;
use crate::errors::{BufferError, Result};
use crate::iterator::DrainIterator;
use crate::storage::{ReadOutcome, Storage};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Disk-backed queue in front of a [`Forwarder`].
///
/// `write` persists each exported batch instead of sending it; `drain` later
/// reads one stored batch and forwards it. Delivery is at-least-once: a batch
/// whose forward fails or times out stays on disk and is retried by the next
/// drain.
pub struct BufferedQueue<T> {
    storage: Arc<Storage>,
    serializer: Arc<dyn Serializer<T>>,
    deserializer: Arc<dyn Deserializer<T>>,
    forwarder: Arc<dyn Forwarder<T>>,
    callback: Arc<dyn ExportCallback<T>>,
}

impl<T: Send + Sync + 'static> BufferedQueue<T> {
    pub fn builder(root_dir: impl AsRef<Path>, folder_name: impl Into<String>) -> BufferedQueueBuilder<T> {
        BufferedQueueBuilder::new(root_dir.as_ref().to_path_buf(), folder_name.into())
    }

    /// Persist a batch.
    ///
    /// If the batch cannot be serialized or stored, it is forwarded right
    /// away instead; only when that fails too is an error returned.
    #[instrument(skip_all, fields(signal = self.deserializer.signal_type(), items = items.len()))]
    pub async fn write(&self, items: Vec<T>) -> Result<()> {
        let stored = match self.serializer.serialize(&items) {
            Ok(bytes) => self.storage.write(&bytes).await,
            Err(err) => Err(err),
        };

        match stored {
            Ok(()) => {
                debug!("Stored batch of {} items on disk", items.len());
                Ok(())
            }
            Err(err) => {
                warn!("Could not store batch on disk, exporting it right away: {}", err);
                self.passthrough(&items).await
            }
        }
    }

    /// Forward one stored batch.
    ///
    /// Returns `true` if a batch was found and the forwarder accepted it
    /// within `timeout`; only then is the batch deleted from disk.
    #[instrument(skip(self), fields(signal = self.deserializer.signal_type()))]
    pub async fn drain(&self, timeout: Duration) -> Result<bool> {
        let outcome = self.drain_next(timeout).await?;
        Ok(outcome == ReadOutcome::Processed(ProcessResult::Succeeded))
    }

    /// Drain until no stored batch is left or a forward fails.
    ///
    /// Batches that cannot be decoded are dropped and draining continues.
    pub async fn drain_all(&self, timeout: Duration) -> Result<usize> {
        let mut exported = 0;
        let mut dropped = 0;

        loop {
            match self.drain_next(timeout).await? {
                ReadOutcome::Processed(ProcessResult::Succeeded) => exported += 1,
                ReadOutcome::Processed(ProcessResult::ContentInvalid) => dropped += 1,
                ReadOutcome::Processed(ProcessResult::TryLater) | ReadOutcome::NoData => break,
            }
        }

        if exported > 0 || dropped > 0 {
            info!(
                "Exported {} stored {} batches, dropped {} undecodable",
                exported,
                self.deserializer.signal_type(),
                dropped
            );
        }
        Ok(exported)
    }

    /// Pull-style access to every stored batch, oldest first
    pub fn iter(&self) -> DrainIterator<T> {
        DrainIterator::new(Arc::clone(&self.storage), Arc::clone(&self.deserializer))
    }

    /// Close the storage. Later writes fall back to direct forwarding and
    /// later drains fail.
    pub async fn shutdown(&self) {
        self.storage.close().await;
        self.callback.on_shutdown();
        info!("{} buffer shut down", self.deserializer.signal_type());
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn signal_type(&self) -> &str {
        self.deserializer.signal_type()
    }

    async fn drain_next(&self, timeout: Duration) -> Result<ReadOutcome> {
        debug!("Attempting to export batch from disk");
        self.storage
            .read(|bytes| async move { self.forward_stored(&bytes, timeout).await })
            .await
    }

    async fn forward_stored(&self, bytes: &[u8], timeout: Duration) -> ProcessResult {
        debug!("Read {} bytes from storage", bytes.len());

        let items = match self.deserializer.deserialize(bytes) {
            Ok(items) => items,
            Err(err) => {
                warn!("Dropping stored batch that cannot be decoded: {}", err);
                return ProcessResult::ContentInvalid;
            }
        };

        debug!("Now exporting batch of {} items", items.len());
        let result = match tokio::time::timeout(timeout, self.forwarder.forward(&items)).await {
            Ok(result) => result,
            Err(_) => Err(BufferError::Transport(format!(
                "forward did not complete within {}ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                self.callback.on_export_success(&items);
                ProcessResult::Succeeded
            }
            Err(err) => {
                warn!("Stored batch not exported, keeping it for later: {}", err);
                self.callback.on_export_error(&items, &err);
                ProcessResult::TryLater
            }
        }
    }

    async fn passthrough(&self, items: &[T]) -> Result<()> {
        match self.forwarder.forward(items).await {
            Ok(()) => {
                self.callback.on_export_success(items);
                Ok(())
            }
            Err(err) => {
                self.callback.on_export_error(items, &err);
                Err(BufferError::ExportFailed(err.to_string()))
            }
        }
    }
}

/// Builder for [`BufferedQueue`]
pub struct BufferedQueueBuilder<T> {
    root_dir: PathBuf,
    folder_name: String,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    serializer: Option<Arc<dyn Serializer<T>>>,
    deserializer: Option<Arc<dyn Deserializer<T>>>,
    forwarder: Option<Arc<dyn Forwarder<T>>>,
    callback: Arc<dyn ExportCallback<T>>,
}

impl<T: Send + Sync + 'static> BufferedQueueBuilder<T> {
    fn new(root_dir: PathBuf, folder_name: String) -> Self {
        Self {
            root_dir,
            folder_name,
            config: StorageConfig::default(),
            clock: Arc::new(SystemClock),
            serializer: None,
            deserializer: None,
            forwarder: None,
            callback: Arc::new(NoopCallback),
        }
    }

    pub fn with_storage_config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer<T>>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn with_deserializer(mut self, deserializer: Arc<dyn Deserializer<T>>) -> Self {
        self.deserializer = Some(deserializer);
        self
    }

    /// Use one value as both serializer and deserializer
    pub fn with_codec<C>(self, codec: Arc<C>) -> Self
    where
        C: Serializer<T> + Deserializer<T> + 'static,
    {
        let serializer: Arc<dyn Serializer<T>> = codec.clone();
        let deserializer: Arc<dyn Deserializer<T>> = codec;
        self.with_serializer(serializer).with_deserializer(deserializer)
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder<T>>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn ExportCallback<T>>) -> Self {
        self.callback = callback;
        self
    }

    /// Validate the configuration, create the signal folder and open storage
    pub async fn build(self) -> Result<BufferedQueue<T>> {
        self.config.validate()?;

        let serializer = self
            .serializer
            .ok_or_else(|| BufferError::Config("a serializer is required".to_string()))?;
        let deserializer = self
            .deserializer
            .ok_or_else(|| BufferError::Config("a deserializer is required".to_string()))?;
        let forwarder = self
            .forwarder
            .ok_or_else(|| BufferError::Config("a forwarder is required".to_string()))?;

        let storage =
            Storage::open(&self.root_dir, &self.folder_name, self.config, self.clock).await?;

        Ok(BufferedQueue {
            storage: Arc::new(storage),
            serializer,
            deserializer,
            forwarder,
            callback: self.callback,
        })
    }
}
