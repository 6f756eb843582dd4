//! # Crdtcake Cluster
//!
//! Partitioned and replicated storage of CRDT entries.
//!
//! Keys are assigned to partitions with rendezvous hashing, every key is written to
//! a replica set in each active [PartitionGroup]. Reads fan in from every partition and
//! merge the copies of a key with the CRDT's merge function, so replicas which missed
//! a write or saw writes in a different order reconcile without any repair protocol.
//!
//! Partition failures are tolerated as long as each replica set keeps its [Quorum],
//! beyond that operations fail with an aggregate error naming the failed partitions.
//!
//! ## Basic Example
//!
//! ```rust
//! use std::collections::{BTreeMap, BTreeSet};
//! use std::sync::Arc;
//!
//! use crdtcake_cluster::{
//!     ClusterCrdtStorage,
//!     ClusterOptions,
//!     PartitionGroup,
//!     PartitionId,
//!     PartitionScheme,
//!     StaticDiscovery,
//! };
//! use crdtcake_crdt::{ignoring_timestamp, CrdtData};
//! use crdtcake_storage::{CrdtStorage, MapCrdtStorage};
//! use futures::{stream, StreamExt, TryStreamExt};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let union = || ignoring_timestamp(|mut a: BTreeSet<u32>, b: BTreeSet<u32>| {
//!         a.extend(b);
//!         a
//!     });
//!
//!     let mut storages = BTreeMap::<PartitionId, Arc<dyn CrdtStorage<String, BTreeSet<u32>>>>::new();
//!     for id in ["a", "b", "c"] {
//!         let storage = MapCrdtStorage::<String, BTreeSet<u32>>::new(union());
//!         storages.insert(PartitionId::new("main", id), Arc::new(storage));
//!     }
//!
//!     let group = PartitionGroup::new(storages.keys().cloned()).with_replicas(2);
//!     let scheme = PartitionScheme::new(vec![group], storages)?;
//!     let cluster = ClusterCrdtStorage::start(
//!         StaticDiscovery::new(scheme),
//!         union(),
//!         ClusterOptions::default(),
//!     )
//!     .await?;
//!
//!     let entries = vec![
//!         Ok(CrdtData::new("key".to_string(), 1, BTreeSet::from([1, 2, 3]))),
//!         Ok(CrdtData::new("key".to_string(), 2, BTreeSet::from([2, 3, 7]))),
//!     ];
//!     cluster.upload(stream::iter(entries).boxed()).await?;
//!
//!     let merged = cluster.download(0).await?.try_collect::<Vec<_>>().await?;
//!     assert_eq!(merged.len(), 1);
//!     assert_eq!(merged[0].state, BTreeSet::from([1, 2, 3, 7]));
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod config;
mod discovery;
mod error;
mod merge;
mod partition;
mod quorum;
mod read;
pub mod rpc;
mod scheme;
mod sharder;
mod statistics;
mod topology;
mod upload;

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Arc;

use crdtcake_crdt::CrdtFunction;
use crdtcake_storage::CrdtStream;
use futures::future::join_all;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

pub use self::config::{load_scheme, parse_partition_groups, ConfigError, ConfigSource};
pub use self::discovery::{DiscoveryService, DynamicDiscovery, StaticDiscovery};
pub use self::error::{ClusterError, FailedPartitions};
pub use self::merge::ClusterStream;
pub use self::partition::{PartitionId, PartitionParseError};
pub use self::quorum::{ClusterOptions, Quorum};
pub use self::read::{ClusterTake, ClusterTakeCommit};
pub use self::scheme::{
    PartitionGroup,
    PartitionHashFn,
    PartitionScheme,
    ReplicaSet,
    SchemeSharder,
    StorageProvider,
};
pub use self::sharder::{bucket_of, BucketSet, RendezvousHashSharder, NUMBER_OF_BUCKETS};
pub use self::statistics::{ClusterStatistics, ClusterStatisticsInner};
use self::statistics::ClusterStatisticsInner as Stats;
use self::topology::{Topology, TopologyHandle};

/// A key which can be routed through the cluster.
pub trait ClusterKey: Hash + Ord + Clone + Send + Sync + 'static {}

impl<T> ClusterKey for T where T: Hash + Ord + Clone + Send + Sync + 'static {}

/// A CRDT state which can be replicated by the cluster.
pub trait ClusterState: Clone + Send + Sync + 'static {}

impl<T> ClusterState for T where T: Clone + Send + Sync + 'static {}

#[inline]
/// Hashes a value down to the 32 bits used for routing keys.
pub fn hash32<T: Hash + ?Sized>(value: &T) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    value.hash(&mut hasher);
    hasher.finalize()
}

/// A CRDT storage spread over the partitions of a [PartitionScheme].
///
/// The scheme is provided by a [DiscoveryService] and watched in the background,
/// every newly published scheme replaces the current one. Partitions are considered
/// dead once an operation against them fails and alive again once they answer a ping.
pub struct ClusterCrdtStorage<K, S> {
    handle: Arc<TopologyHandle<K, S>>,
    function: Arc<dyn CrdtFunction<S>>,
    options: ClusterOptions,
    watcher: JoinHandle<()>,
}

impl<K, S> ClusterCrdtStorage<K, S>
where
    K: ClusterKey,
    S: ClusterState,
{
    /// Starts the cluster storage with the first scheme published by the discovery service.
    ///
    /// Every partition is pinged once, partitions which do not answer start out dead.
    pub async fn start<D>(
        discovery: D,
        function: impl CrdtFunction<S>,
        options: ClusterOptions,
    ) -> Result<Self, ClusterError>
    where
        D: DiscoveryService<K, S>,
    {
        let mut schemes = discovery.discover();
        let scheme = schemes
            .next()
            .await
            .ok_or(ClusterError::NoSendersAvailable)?;

        let handle = Arc::new(TopologyHandle::new(scheme, options.statistics.clone()));
        probe_partitions(&handle, &handle.snapshot()).await;

        let watcher = tokio::spawn(watch_schemes(handle.clone(), schemes));

        let topology = handle.snapshot();
        info!(
            num_partitions = topology.scheme.partitions().len(),
            num_alive = topology.alive.len(),
            "Cluster storage is running.",
        );

        Ok(Self {
            handle,
            function: Arc::new(function),
            options,
            watcher,
        })
    }

    #[inline]
    pub fn statistics(&self) -> &ClusterStatistics {
        &self.options.statistics
    }

    #[inline]
    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// The scheme currently in use.
    pub fn scheme(&self) -> Arc<PartitionScheme<K, S>> {
        self.handle.snapshot().scheme.clone()
    }

    /// The partitions currently believed to be alive.
    pub fn alive_partitions(&self) -> Vec<PartitionId> {
        self.handle.snapshot().alive.iter().cloned().collect()
    }

    /// The partitions currently believed to be dead.
    pub fn dead_partitions(&self) -> Vec<PartitionId> {
        self.handle.snapshot().dead()
    }

    /// Uploads the entries to the replica set of each entry's key.
    ///
    /// Entries are streamed to each partition as they arrive, a partition session is
    /// opened on the first key routed to it. The upload fails once any replica set
    /// written to drops below the upload [Quorum]; some partitions may still have
    /// applied the entries in that case. Retrying is safe as merges are idempotent.
    ///
    /// An error produced by the stream aborts every session.
    pub async fn upload(&self, entries: CrdtStream<K, S>) -> Result<(), ClusterError> {
        upload::upload(&self.handle, &self.options, entries).await
    }

    /// Downloads every entry modified at or after `timestamp`.
    ///
    /// The returned stream is sorted by key with the copies of each key merged.
    /// Partitions failing part way through are skipped as long as the remaining
    /// partitions still hold every key, otherwise the stream ends with
    /// [ClusterError::DownloadFailed].
    pub async fn download(&self, timestamp: u64) -> Result<ClusterStream<K, S>, ClusterError> {
        read::download(&self.handle, &self.function, &self.options, timestamp).await
    }

    /// Takes every entry out of the cluster.
    ///
    /// Entries are only removed from the partitions once the returned take is
    /// committed, and only from partitions whose entries were fully read.
    pub async fn take(&self) -> Result<ClusterTake<K, S>, ClusterError> {
        read::take(&self.handle, &self.function, &self.options).await
    }

    /// Pings every partition.
    ///
    /// Succeeds if every group keeps the ping [Quorum] in each of its replica sets.
    /// Partitions answering are marked alive, the rest dead.
    pub async fn ping(&self) -> Result<(), ClusterError> {
        Stats::incr(&self.statistics().num_pings);

        let topology = self.handle.snapshot();
        let failed = probe_partitions(&self.handle, &topology).await;

        let unhealthy = failed
            .iter()
            .filter_map(|partition| topology.scheme.index_of(partition).ok())
            .collect::<BTreeSet<_>>();

        if !topology
            .scheme
            .is_healthy(&unhealthy, self.options.ping_quorum)
        {
            let error = ClusterError::PingFailed(FailedPartitions::new(
                failed,
                topology.scheme.partitions().len(),
            ));
            error!(error = %error, "Cluster ping failed.");
            return Err(error);
        }

        Ok(())
    }

    /// Pings every dead partition, marking those which answer as alive.
    ///
    /// Returns the revived partitions.
    pub async fn check_dead_partitions(&self) -> Vec<PartitionId> {
        let topology = self.handle.snapshot();
        let dead = topology.dead();
        if dead.is_empty() {
            return dead;
        }

        let results = ping_all(&topology, dead).await;
        let revived = results
            .into_iter()
            .filter(|(_, alive)| *alive)
            .map(|(partition, _)| partition)
            .collect::<Vec<_>>();

        self.handle.mark_alive(revived.iter());
        revived
    }
}

impl<K, S> Drop for ClusterCrdtStorage<K, S> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Pings the partitions concurrently, returning if each answered.
async fn ping_all<K, S>(
    topology: &Topology<K, S>,
    partitions: Vec<PartitionId>,
) -> Vec<(PartitionId, bool)>
where
    K: 'static,
    S: 'static,
{
    let pings = partitions.into_iter().map(|partition| async move {
        let client = match topology.scheme.client(&partition) {
            Some(client) => client,
            None => {
                warn!(partition = %partition, "No storage client for partition.");
                return (partition, false);
            },
        };

        match client.ping().await {
            Ok(()) => (partition, true),
            Err(e) => {
                warn!(partition = %partition, error = %e, "Partition failed to answer ping.");
                (partition, false)
            },
        }
    });

    join_all(pings).await
}

/// Pings every partition of the topology and updates their liveness.
///
/// Returns the partitions which failed.
async fn probe_partitions<K, S>(
    handle: &TopologyHandle<K, S>,
    topology: &Topology<K, S>,
) -> Vec<PartitionId>
where
    K: 'static,
    S: 'static,
{
    let results = ping_all(topology, topology.scheme.partitions().to_vec()).await;

    let (alive, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(|(_, alive)| *alive);
    let alive = alive.into_iter().map(|(p, _)| p).collect::<Vec<_>>();
    let failed = failed.into_iter().map(|(p, _)| p).collect::<Vec<_>>();

    for _ in 0..failed.len() {
        Stats::incr(&handle.statistics().num_partition_failures);
    }
    handle.mark_alive(alive.iter());
    handle.mark_dead(failed.iter());
    failed
}

async fn watch_schemes<K, S>(
    handle: Arc<TopologyHandle<K, S>>,
    mut schemes: WatchStream<Arc<PartitionScheme<K, S>>>,
) where
    K: ClusterKey,
    S: ClusterState,
{
    while let Some(scheme) = schemes.next().await {
        info!(
            num_partitions = scheme.partitions().len(),
            "Installing new partition scheme.",
        );
        handle.install(scheme);
        probe_partitions(&handle, &handle.snapshot()).await;
    }

    debug!("Discovery service closed, keeping the current scheme.");
}
