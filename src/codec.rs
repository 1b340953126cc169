//! Collaborator interfaces plugged into the buffered queue

use crate::errors::{BufferError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// Turns a batch of items into the bytes stored as one record
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, items: &[T]) -> Result<Vec<u8>>;
}

/// Turns one stored record back into its batch
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<T>>;

    /// Label used in log messages, e.g. `spans`
    fn signal_type(&self) -> &str;
}

/// The exporter the buffer shields: sends a batch to its real destination
#[async_trait]
pub trait Forwarder<T>: Send + Sync {
    async fn forward(&self, items: &[T]) -> Result<()>;
}

/// Informational hooks fired by the buffered queue
pub trait ExportCallback<T>: Send + Sync {
    fn on_export_success(&self, _items: &[T]) {}

    fn on_export_error(&self, _items: &[T], _error: &BufferError) {}

    fn on_shutdown(&self) {}
}

/// Callback that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl<T> ExportCallback<T> for NoopCallback {}

/// JSON codec for any serde type; one record holds one JSON array.
pub struct JsonCodec<T> {
    signal_type: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new(signal_type: impl Into<String>) -> Self {
        Self {
            signal_type: signal_type.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec")
            .field("signal_type", &self.signal_type)
            .finish()
    }
}

impl<T: Serialize> Serializer<T> for JsonCodec<T> {
    fn serialize(&self, items: &[T]) -> Result<Vec<u8>> {
        serde_json::to_vec(items)
            .map_err(|err| BufferError::Serialization(format!("{}: {}", self.signal_type, err)))
    }
}

impl<T: DeserializeOwned> Deserializer<T> for JsonCodec<T> {
    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<T>> {
        serde_json::from_slice(bytes)
            .map_err(|err| BufferError::Serialization(format!("{}: {}", self.signal_type, err)))
    }

    fn signal_type(&self) -> &str {
        &self.signal_type
    }
}
