//! Pull-style iteration over every stored batch of a queue

use crate::codec::Deserializer;
use crate::errors::{BufferError, Result};
use crate::storage::Storage;

use futures::Stream;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Walks the stored batches oldest first.
///
/// Batches are left on disk unless [`remove`](Self::remove) is called right
/// after the [`next`](Self::next) that returned them, so iterating without
/// removing is a read-only pass and a later iterator sees the same batches.
/// Records that cannot be decoded are deleted and skipped.
pub struct DrainIterator<T> {
    storage: Arc<Storage>,
    deserializer: Arc<dyn Deserializer<T>>,
    excluded: HashSet<u64>,
    lookahead: Option<Vec<T>>,
    can_remove: bool,
    started: bool,
}

impl<T> DrainIterator<T> {
    pub fn new(storage: Arc<Storage>, deserializer: Arc<dyn Deserializer<T>>) -> Self {
        Self {
            storage,
            deserializer,
            excluded: HashSet::new(),
            lookahead: None,
            can_remove: false,
            started: false,
        }
    }

    /// Whether another batch is available.
    ///
    /// Looking ahead moves past the batch returned by the previous `next`, so
    /// that batch can no longer be removed afterwards.
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.lookahead.is_none() {
            self.lookahead = self.fetch().await?;
        }
        Ok(self.lookahead.is_some())
    }

    pub async fn next(&mut self) -> Option<Result<Vec<T>>> {
        let items = match self.lookahead.take() {
            Some(items) => items,
            None => match self.fetch().await {
                Ok(Some(items)) => items,
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            },
        };

        self.can_remove = true;
        Some(Ok(items))
    }

    /// Delete the batch returned by the directly preceding `next` from disk
    pub async fn remove(&mut self) -> Result<()> {
        if !self.can_remove {
            return Err(BufferError::InvalidState(
                "next() must be called before remove()".to_string(),
            ));
        }

        self.can_remove = false;
        self.storage.remove_last().await
    }

    /// Adapt into a stream that ends after the last batch or the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<T>>> {
        futures::stream::unfold((self, false), |(mut iter, failed)| async move {
            if failed {
                return None;
            }
            let item = iter.next().await?;
            let failed = item.is_err();
            Some((item, (iter, failed)))
        })
    }

    async fn fetch(&mut self) -> Result<Option<Vec<T>>> {
        self.can_remove = false;

        if !self.started {
            self.started = true;
            self.storage.reset_read_cursor().await;
        }

        while let Some(bytes) = self.storage.read_next_excluding(&mut self.excluded).await? {
            match self.deserializer.deserialize(&bytes) {
                Ok(items) => return Ok(Some(items)),
                Err(err) => {
                    warn!(
                        "Dropping stored {} batch that cannot be decoded: {}",
                        self.deserializer.signal_type(),
                        err
                    );
                    self.storage.remove_last().await?;
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::{JsonCodec, Serializer};
    use crate::config::StorageConfig;
    use futures::StreamExt;

    fn config() -> StorageConfig {
        StorageConfig {
            max_file_size: 1024,
            max_folder_size: 10 * 1024,
            min_file_age_for_read_ms: 10,
            max_file_age_for_read_ms: 10_000,
            max_file_age_for_write_ms: 5,
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        storage: Arc<Storage>,
        codec: Arc<JsonCodec<String>>,
    }

    impl Fixture {
        fn iter(&self) -> DrainIterator<String> {
            DrainIterator::new(Arc::clone(&self.storage), self.codec.clone())
        }

        async fn collect(&self) -> Vec<Vec<String>> {
            self.iter()
                .into_stream()
                .map(|item| item.unwrap())
                .collect()
                .await
        }

        fn file_count(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("logs")).unwrap().count()
        }
    }

    fn batch(item: &str) -> Vec<String> {
        vec![item.to_string()]
    }

    async fn write(storage: &Storage, codec: &JsonCodec<String>, item: &str) {
        storage.write(&codec.serialize(&batch(item)).unwrap()).await.unwrap();
    }

    /// "a" and "b" in the first file, "c" in the second
    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        let storage = Arc::new(
            Storage::open(dir.path(), "logs", config(), clock.clone())
                .await
                .unwrap(),
        );
        let codec = Arc::new(JsonCodec::new("logs"));

        write(&storage, &codec, "a").await;
        write(&storage, &codec, "b").await;
        clock.advance(6);
        write(&storage, &codec, "c").await;
        clock.set(1100);

        Fixture { dir, storage, codec }
    }

    #[tokio::test]
    async fn test_iterating_without_remove_keeps_everything() {
        let fx = fixture().await;

        assert_eq!(fx.collect().await, vec![batch("a"), batch("b"), batch("c")]);
        assert_eq!(fx.file_count(), 2);

        assert_eq!(fx.collect().await, vec![batch("a"), batch("b"), batch("c")]);
    }

    #[tokio::test]
    async fn test_selective_remove() {
        let fx = fixture().await;
        let mut iter = fx.iter();

        while let Some(items) = iter.next().await {
            if items.unwrap() == batch("b") {
                iter.remove().await.unwrap();
            }
        }

        assert_eq!(fx.collect().await, vec![batch("a"), batch("c")]);
        assert_eq!(fx.file_count(), 2);
    }

    #[tokio::test]
    async fn test_removing_everything_empties_the_folder() {
        let fx = fixture().await;
        let mut iter = fx.iter();
        let mut seen = Vec::new();

        while iter.has_next().await.unwrap() {
            seen.push(iter.next().await.unwrap().unwrap());
            iter.remove().await.unwrap();
        }

        assert_eq!(seen, vec![batch("a"), batch("b"), batch("c")]);
        assert_eq!(fx.file_count(), 0);
        assert!(fx.collect().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_requires_preceding_next() {
        let fx = fixture().await;
        let mut iter = fx.iter();

        assert!(matches!(iter.remove().await, Err(BufferError::InvalidState(_))));

        iter.next().await.unwrap().unwrap();
        iter.remove().await.unwrap();
        assert!(matches!(iter.remove().await, Err(BufferError::InvalidState(_))));

        iter.next().await.unwrap().unwrap();
        assert!(iter.has_next().await.unwrap());
        assert!(matches!(iter.remove().await, Err(BufferError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_undecodable_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        let storage = Arc::new(
            Storage::open(dir.path(), "logs", config(), clock.clone())
                .await
                .unwrap(),
        );
        let codec = Arc::new(JsonCodec::new("logs"));

        write(&storage, &codec, "good").await;
        storage.write(b"not json").await.unwrap();
        clock.set(1100);

        let fx = Fixture { dir, storage, codec };
        assert_eq!(fx.collect().await, vec![batch("good")]);
        assert_eq!(fx.collect().await, vec![batch("good")]);
    }

    #[tokio::test]
    async fn test_iterator_fails_after_close() {
        let fx = fixture().await;
        let mut iter = fx.iter();

        fx.storage.close().await;

        assert!(matches!(iter.has_next().await, Err(BufferError::Closed)));
        assert!(matches!(iter.next().await, Some(Err(BufferError::Closed))));
    }

    #[tokio::test]
    async fn test_nothing_to_iterate_before_min_read_age() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        let storage = Arc::new(
            Storage::open(dir.path(), "logs", config(), clock)
                .await
                .unwrap(),
        );
        let codec = Arc::new(JsonCodec::new("logs"));
        write(&storage, &codec, "fresh").await;

        let mut iter = DrainIterator::<String>::new(storage, codec);
        assert!(!iter.has_next().await.unwrap());
        assert!(iter.next().await.is_none());
    }
}
