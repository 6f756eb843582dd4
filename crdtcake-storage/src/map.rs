use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use crdtcake_crdt::{CrdtData, CrdtFunction};
use futures::{stream, StreamExt, TryStreamExt};
use parking_lot::RwLock;

use crate::{CrdtStorage, CrdtStream, StorageError, Take, TakeCommit};

struct Slot<K, S> {
    /// Bumped on every write, used to detect changes made after a take.
    version: u64,
    data: CrdtData<K, S>,
}

struct MapState<K, S> {
    entries: BTreeMap<K, Slot<K, S>>,
    next_version: u64,
}

#[derive(Clone)]
/// An in-memory CRDT storage which merges entries as they are written.
pub struct MapCrdtStorage<K, S> {
    function: Arc<dyn CrdtFunction<S>>,
    state: Arc<RwLock<MapState<K, S>>>,
}

impl<K, S> MapCrdtStorage<K, S>
where
    K: Ord + Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    pub fn new(function: impl CrdtFunction<S>) -> Self {
        Self::with_function(Arc::new(function))
    }

    pub fn with_function(function: Arc<dyn CrdtFunction<S>>) -> Self {
        Self {
            function,
            state: Arc::new(RwLock::new(MapState {
                entries: BTreeMap::new(),
                next_version: 0,
            })),
        }
    }

    /// Merges a single entry into the storage.
    pub fn put(&self, data: CrdtData<K, S>) {
        let mut state = self.state.write();
        state.merge(data, self.function.as_ref());
    }

    pub fn get(&self, key: &K) -> Option<CrdtData<K, S>> {
        self.state.read().entries.get(key).map(|slot| slot.data.clone())
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every entry matching the predicate, in key order.
    pub fn snapshot<P>(&self, predicate: P) -> Vec<CrdtData<K, S>>
    where
        P: Fn(&CrdtData<K, S>) -> bool,
    {
        self.state
            .read()
            .entries
            .values()
            .filter(|slot| predicate(&slot.data))
            .map(|slot| slot.data.clone())
            .collect()
    }
}

impl<K: Ord + Clone, S: 'static> MapState<K, S> {
    fn merge(&mut self, data: CrdtData<K, S>, function: &dyn CrdtFunction<S>) {
        self.next_version += 1;
        let version = self.next_version;

        match self.entries.remove(&data.key) {
            Some(existing) => {
                let merged = existing.data.merge_with(data, function);
                self.entries.insert(merged.key.clone(), Slot { version, data: merged });
            },
            None => {
                self.entries.insert(data.key.clone(), Slot { version, data });
            },
        }
    }
}

#[async_trait]
impl<K, S> CrdtStorage<K, S> for MapCrdtStorage<K, S>
where
    K: Ord + Clone + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    async fn upload(&self, entries: CrdtStream<K, S>) -> Result<(), StorageError> {
        let entries = entries.try_collect::<Vec<_>>().await?;
        let num_entries = entries.len();

        let mut state = self.state.write();
        for data in entries {
            state.merge(data, self.function.as_ref());
        }

        debug!(num_entries = num_entries, "Applied upload to map storage.");
        Ok(())
    }

    async fn download(&self, timestamp: u64) -> Result<CrdtStream<K, S>, StorageError> {
        let entries = self
            .state
            .read()
            .entries
            .values()
            .filter_map(|slot| slot.data.clone().extract(timestamp, self.function.as_ref()))
            .map(Ok)
            .collect::<Vec<_>>();

        Ok(stream::iter(entries).boxed())
    }

    async fn take(&self) -> Result<Take<K, S>, StorageError> {
        let (versions, entries): (Vec<_>, Vec<_>) = self
            .state
            .read()
            .entries
            .values()
            .map(|slot| ((slot.data.key.clone(), slot.version), Ok(slot.data.clone())))
            .unzip();

        let commit = MapTakeCommit {
            state: self.state.clone(),
            versions,
        };

        Ok(Take::new(stream::iter(entries).boxed(), commit))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

struct MapTakeCommit<K, S> {
    state: Arc<RwLock<MapState<K, S>>>,
    versions: Vec<(K, u64)>,
}

#[async_trait]
impl<K, S> TakeCommit for MapTakeCommit<K, S>
where
    K: Ord + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let mut num_removed = 0;
        for (key, version) in self.versions {
            let unchanged = state
                .entries
                .get(&key)
                .map(|slot| slot.version == version)
                .unwrap_or(false);

            if unchanged {
                state.entries.remove(&key);
                num_removed += 1;
            }
        }

        debug!(num_removed = num_removed, "Committed take of map storage.");
        Ok(())
    }
}
