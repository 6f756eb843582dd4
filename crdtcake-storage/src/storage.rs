use async_trait::async_trait;
use crdtcake_crdt::CrdtData;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::StorageError;

/// A stream of entries flowing into or out of a storage.
pub type CrdtStream<K, S> = BoxStream<'static, Result<CrdtData<K, S>, StorageError>>;

#[async_trait]
/// The storage of a single partition.
///
/// This is implemented by the local engines and by the network client
/// talking to a remote partition, the cluster treats both the same way.
pub trait CrdtStorage<K, S>: Send + Sync + 'static {
    /// Consumes the stream of entries and merges them into the storage.
    ///
    /// Uploads are all-or-nothing, if the stream yields an error the storage
    /// must discard everything it has received so far and return an error.
    async fn upload(&self, entries: CrdtStream<K, S>) -> Result<(), StorageError>;

    /// Produces every entry modified at or after `timestamp`.
    ///
    /// The stream must be sorted by key with each key appearing once.
    async fn download(&self, timestamp: u64) -> Result<CrdtStream<K, S>, StorageError>;

    /// Takes a snapshot of the storage which is removed once committed.
    ///
    /// Entries which are modified after the snapshot was taken must survive
    /// the commit.
    async fn take(&self) -> Result<Take<K, S>, StorageError>;

    /// Checks the storage is able to serve requests.
    async fn ping(&self) -> Result<(), StorageError>;
}

#[async_trait]
/// Finalises a [Take] by removing the taken entries from the storage.
pub trait TakeCommit: Send + 'static {
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// The entries produced by [CrdtStorage::take] along with the handle
/// used to remove them once the consumer is done.
pub struct Take<K, S> {
    entries: CrdtStream<K, S>,
    commit: Box<dyn TakeCommit>,
}

impl<K, S> Take<K, S> {
    pub fn new(entries: CrdtStream<K, S>, commit: impl TakeCommit) -> Self {
        Self {
            entries,
            commit: Box::new(commit),
        }
    }

    /// Reassembles a take, typically after wrapping its stream.
    pub fn from_parts(entries: CrdtStream<K, S>, commit: Box<dyn TakeCommit>) -> Self {
        Self { entries, commit }
    }

    pub fn into_parts(self) -> (CrdtStream<K, S>, Box<dyn TakeCommit>) {
        (self.entries, self.commit)
    }

    /// Drains the stream of entries and commits the take.
    pub async fn collect_and_commit(self) -> Result<Vec<CrdtData<K, S>>, StorageError> {
        let entries = self.entries.try_collect::<Vec<_>>().await?;
        self.commit.commit().await?;
        Ok(entries)
    }
}

#[cfg(any(test, feature = "test-suite"))]
pub mod test_suite {
    use std::any::type_name;
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use crdtcake_crdt::CrdtData;
    use futures::{stream, StreamExt, TryStreamExt};

    use super::*;

    /// Wraps a storage and logs every call made to it.
    pub struct InstrumentedStorage<T>(pub T);

    #[async_trait]
    impl<K, S, T> CrdtStorage<K, S> for InstrumentedStorage<T>
    where
        K: Send + 'static,
        S: Send + 'static,
        T: CrdtStorage<K, S>,
    {
        async fn upload(&self, entries: CrdtStream<K, S>) -> Result<(), StorageError> {
            info!(storage = type_name::<T>(), "upload");
            self.0.upload(entries).await
        }

        async fn download(
            &self,
            timestamp: u64,
        ) -> Result<CrdtStream<K, S>, StorageError> {
            info!(storage = type_name::<T>(), timestamp = timestamp, "download");
            self.0.download(timestamp).await
        }

        async fn take(&self) -> Result<Take<K, S>, StorageError> {
            info!(storage = type_name::<T>(), "take");
            self.0.take().await
        }

        async fn ping(&self) -> Result<(), StorageError> {
            info!(storage = type_name::<T>(), "ping");
            self.0.ping().await
        }
    }

    /// Builds an upload stream of set entries.
    pub fn entries<I>(entries: I) -> CrdtStream<String, BTreeSet<u32>>
    where
        I: IntoIterator<Item = (&'static str, u64, Vec<u32>)>,
    {
        let entries = entries
            .into_iter()
            .map(|(key, ts, values)| {
                Ok(CrdtData::new(key.to_string(), ts, values.into_iter().collect()))
            })
            .collect::<Vec<_>>();
        stream::iter(entries).boxed()
    }

    /// Runs the storage contract against a storage using set union as its
    /// merge function.
    pub async fn run_test_suite<T>(storage: T)
    where
        T: CrdtStorage<String, BTreeSet<u32>>,
    {
        let storage = InstrumentedStorage(storage);

        info!("Starting test");
        storage.ping().await.expect("Ping storage");

        test_upload_then_download(&storage).await;
        test_aborted_upload_is_discarded(&storage).await;
        test_download_horizon(&storage).await;
        test_take(&storage).await;
    }

    async fn download_all<T>(storage: &T, ts: u64) -> Vec<CrdtData<String, BTreeSet<u32>>>
    where
        T: CrdtStorage<String, BTreeSet<u32>>,
    {
        storage
            .download(ts)
            .await
            .expect("Open download")
            .try_collect()
            .await
            .expect("Download entries")
    }

    async fn test_upload_then_download<T>(storage: &T)
    where
        T: CrdtStorage<String, BTreeSet<u32>>,
    {
        info!("test_upload_then_download");

        storage
            .upload(entries([("b", 1, vec![1, 2]), ("a", 1, vec![5])]))
            .await
            .expect("Upload entries");
        storage
            .upload(entries([("b", 2, vec![3])]))
            .await
            .expect("Upload entries");

        let downloaded = download_all(storage, 0).await;
        let keys = downloaded.iter().map(|e| e.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, ["a", "b"], "Downloads should be sorted by key.");
        assert_eq!(downloaded[1].state, BTreeSet::from([1, 2, 3]));
        assert_eq!(downloaded[1].timestamp, 2);
    }

    async fn test_aborted_upload_is_discarded<T>(storage: &T)
    where
        T: CrdtStorage<String, BTreeSet<u32>>,
    {
        info!("test_aborted_upload_is_discarded");

        let aborted = stream::iter(vec![
            Ok(CrdtData::new("c".to_string(), 3, BTreeSet::from([9]))),
            Err(StorageError::Aborted("Test abort".to_string())),
        ])
        .boxed();
        let result = storage.upload(aborted).await;
        assert!(result.is_err(), "Aborted upload should return an error.");

        let keys = download_all(storage, 0)
            .await
            .into_iter()
            .map(|e| e.key)
            .collect::<Vec<_>>();
        assert_eq!(keys, ["a", "b"], "Nothing of the aborted upload should be applied.");
    }

    async fn test_download_horizon<T>(storage: &T)
    where
        T: CrdtStorage<String, BTreeSet<u32>>,
    {
        info!("test_download_horizon");

        let keys = download_all(storage, 2)
            .await
            .into_iter()
            .map(|e| e.key)
            .collect::<Vec<_>>();
        assert_eq!(keys, ["b"], "Only entries at or after the horizon should be returned.");
    }

    async fn test_take<T>(storage: &T)
    where
        T: CrdtStorage<String, BTreeSet<u32>>,
    {
        info!("test_take");

        let take = storage.take().await.expect("Take storage");
        let (taken, commit) = take.into_parts();
        let taken = taken.try_collect::<Vec<_>>().await.expect("Drain take");
        assert_eq!(taken.len(), 2);

        // Uncommitted takes leave the storage untouched.
        assert_eq!(download_all(storage, 0).await.len(), 2);

        commit.commit().await.expect("Commit take");
        assert!(
            download_all(storage, 0).await.is_empty(),
            "Committed take should remove the taken entries."
        );
    }
}
