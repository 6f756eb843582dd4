#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crdtcake_cluster::rpc::{CrdtServer, RemoteNetwork, RemoteOptions};
use crdtcake_cluster::{PartitionGroup, PartitionId, PartitionScheme};
use crdtcake_crdt::{ignoring_timestamp, CodecError, CrdtCodec, CrdtData, IgnoringTimestamp};
use crdtcake_storage::{CrdtStorage, CrdtStream, MapCrdtStorage, StorageError, Take};
use futures::{stream, StreamExt};

pub type Set = BTreeSet<u32>;
pub type Union = IgnoringTimestamp<fn(Set, Set) -> Set>;

pub fn union() -> Union {
    fn union_sets(mut a: Set, b: Set) -> Set {
        a.extend(b);
        a
    }
    ignoring_timestamp(union_sets as fn(_, _) -> _)
}

pub fn entry(key: impl Into<String>, timestamp: u64, values: impl IntoIterator<Item = u32>) -> CrdtData<String, Set> {
    CrdtData::new(key.into(), timestamp, values.into_iter().collect())
}

/// An upload stream of `n` distinct keys.
pub fn numbered_entries(n: usize) -> CrdtStream<String, Set> {
    stream::iter((0..n).map(|i| Ok(entry(format!("key-{:08}", i), 1, [i as u32])))).boxed()
}

#[derive(Clone)]
/// An in-memory storage which can be killed and revived.
///
/// A killed storage fails every request, including streams which are
/// already in flight.
pub struct KillableStorage {
    inner: MapCrdtStorage<String, Set>,
    killed: Arc<AtomicBool>,
}

impl Default for KillableStorage {
    fn default() -> Self {
        Self {
            inner: MapCrdtStorage::new(union()),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl KillableStorage {
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    pub fn revive(&self) {
        self.killed.store(false, Ordering::Relaxed);
    }

    pub fn inner(&self) -> &MapCrdtStorage<String, Set> {
        &self.inner
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.killed.load(Ordering::Relaxed) {
            Err(StorageError::Unavailable("Storage was killed".to_string()))
        } else {
            Ok(())
        }
    }

    fn guard(&self, entries: CrdtStream<String, Set>) -> CrdtStream<String, Set> {
        let killed = self.killed.clone();
        entries
            .map(move |entry| {
                if killed.load(Ordering::Relaxed) {
                    Err(StorageError::Unavailable("Storage was killed".to_string()))
                } else {
                    entry
                }
            })
            .boxed()
    }
}

#[async_trait]
impl CrdtStorage<String, Set> for KillableStorage {
    async fn upload(&self, entries: CrdtStream<String, Set>) -> Result<(), StorageError> {
        self.check()?;
        self.inner.upload(self.guard(entries)).await
    }

    async fn download(&self, timestamp: u64) -> Result<CrdtStream<String, Set>, StorageError> {
        self.check()?;
        let entries = self.inner.download(timestamp).await?;
        Ok(self.guard(entries))
    }

    async fn take(&self) -> Result<Take<String, Set>, StorageError> {
        self.check()?;
        let (entries, commit) = self.inner.take().await?.into_parts();
        Ok(Take::from_parts(self.guard(entries), commit))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }
}

/// Creates `n` killable partitions in the group `"g"`.
pub fn killable_partitions(n: usize) -> BTreeMap<PartitionId, KillableStorage> {
    (0..n)
        .map(|i| (PartitionId::new("g", format!("p{}", i)), KillableStorage::default()))
        .collect()
}

/// Creates a single group scheme over the partitions.
pub fn scheme_of(
    partitions: &BTreeMap<PartitionId, KillableStorage>,
    replicas: usize,
    repartition: bool,
) -> PartitionScheme<String, Set> {
    let provider = partitions
        .iter()
        .map(|(id, storage)| {
            let storage: Arc<dyn CrdtStorage<String, Set>> = Arc::new(storage.clone());
            (id.clone(), storage)
        })
        .collect::<BTreeMap<_, _>>();

    let group = PartitionGroup::new(partitions.keys().cloned())
        .with_replicas(replicas)
        .with_repartition(repartition);
    PartitionScheme::new(vec![group], provider).expect("Create scheme")
}

/// Encodes set entries as `key len | key | timestamp | values`.
pub struct SetCodec;

impl CrdtCodec<String, Set> for SetCodec {
    fn encode(&self, data: &CrdtData<String, Set>) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(12 + data.key.len() + data.state.len() * 4);
        buf.extend_from_slice(&(data.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(data.key.as_bytes());
        buf.extend_from_slice(&data.timestamp.to_le_bytes());
        for value in data.state.iter() {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<CrdtData<String, Set>, CodecError> {
        let invalid = || CodecError::Decode("Invalid set entry".to_string());

        let mut key_len = [0; 4];
        key_len.copy_from_slice(bytes.get(..4).ok_or_else(invalid)?);
        let key_len = u32::from_le_bytes(key_len) as usize;

        let key = bytes.get(4..4 + key_len).ok_or_else(invalid)?;
        let key = String::from_utf8(key.to_vec()).map_err(|_| invalid())?;

        let mut timestamp = [0; 8];
        timestamp.copy_from_slice(bytes.get(4 + key_len..12 + key_len).ok_or_else(invalid)?);

        let values = bytes.get(12 + key_len..).ok_or_else(invalid)?;
        if values.len() % 4 != 0 {
            return Err(invalid());
        }
        let state = values
            .chunks_exact(4)
            .map(|chunk| {
                let mut value = [0; 4];
                value.copy_from_slice(chunk);
                u32::from_le_bytes(value)
            })
            .collect();

        Ok(CrdtData::new(key, u64::from_le_bytes(timestamp), state))
    }
}

/// A partition served over TCP.
pub struct RemotePartition {
    pub id: PartitionId,
    pub server: CrdtServer,
    pub storage: MapCrdtStorage<String, Set>,
}

/// Starts `n` partition servers in the group `"g"`.
pub async fn start_remote_partitions(n: usize) -> anyhow::Result<Vec<RemotePartition>> {
    let mut partitions = Vec::with_capacity(n);
    for (i, addr) in test_helper::get_unused_addrs(n).into_iter().enumerate() {
        let storage = MapCrdtStorage::new(union());
        let server = CrdtServer::listen(
            addr,
            Arc::new(storage.clone()) as Arc<dyn CrdtStorage<String, Set>>,
            Arc::new(SetCodec) as Arc<dyn CrdtCodec<String, Set>>,
        )
        .await?;

        let id = PartitionId::new("g", format!("p{}", i)).with_storage_addr(server.local_addr());
        partitions.push(RemotePartition { id, server, storage });
    }
    Ok(partitions)
}

/// Creates a single group scheme reaching the partitions over the network.
pub fn remote_scheme(
    partitions: &[RemotePartition],
    replicas: usize,
    repartition: bool,
) -> PartitionScheme<String, Set> {
    let network = RemoteNetwork::new(SetCodec, RemoteOptions::default());
    let group = PartitionGroup::new(partitions.iter().map(|p| p.id.clone()))
        .with_replicas(replicas)
        .with_repartition(repartition);
    PartitionScheme::new(vec![group], network).expect("Create scheme")
}
