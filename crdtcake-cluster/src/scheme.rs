use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crdtcake_storage::CrdtStorage;
use smallvec::SmallVec;

use crate::config::ConfigError;
use crate::error::ClusterError;
use crate::quorum::Quorum;
use crate::sharder::{BucketSet, RendezvousHashSharder, NUMBER_OF_BUCKETS};
use crate::PartitionId;

/// The partitions a key is routed to, as indices into [PartitionScheme::partitions].
pub type ReplicaSet = SmallVec<[usize; 8]>;

/// Produces the hash ranking a partition within the sharder.
pub type PartitionHashFn = Arc<dyn Fn(&PartitionId) -> u32 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// An independently configured set of partitions.
///
/// Every key is written to `replicas` partitions of every active group.
/// Inactive groups receive no new writes but are still read from, which
/// allows data to be migrated between groups.
pub struct PartitionGroup {
    partitions: BTreeSet<PartitionId>,
    replicas: usize,
    repartition: bool,
    active: bool,
}

impl PartitionGroup {
    /// Creates a new active group with a single replica per key.
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            partitions: partitions.into_iter().collect(),
            replicas: 1,
            repartition: false,
            active: true,
        }
    }

    /// Sets the number of partitions each key is replicated to.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// If the group should redistribute keys over its alive members
    /// when partitions die.
    ///
    /// Without repartitioning, dead partitions keep their share of the
    /// keys and count as failed replicas.
    pub fn with_repartition(mut self, repartition: bool) -> Self {
        self.repartition = repartition;
        self
    }

    /// If the group accepts new writes.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn partitions(&self) -> &BTreeSet<PartitionId> {
        &self.partitions
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn repartition(&self) -> bool {
        self.repartition
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Resolves the storage client of a partition.
pub trait StorageProvider<K, S>: Send + Sync + 'static {
    fn get_storage(&self, partition: &PartitionId) -> Option<Arc<dyn CrdtStorage<K, S>>>;
}

impl<K, S> StorageProvider<K, S> for HashMap<PartitionId, Arc<dyn CrdtStorage<K, S>>>
where
    K: 'static,
    S: 'static,
{
    fn get_storage(&self, partition: &PartitionId) -> Option<Arc<dyn CrdtStorage<K, S>>> {
        self.get(partition).cloned()
    }
}

impl<K, S> StorageProvider<K, S> for BTreeMap<PartitionId, Arc<dyn CrdtStorage<K, S>>>
where
    K: 'static,
    S: 'static,
{
    fn get_storage(&self, partition: &PartitionId) -> Option<Arc<dyn CrdtStorage<K, S>>> {
        self.get(partition).cloned()
    }
}

impl<K, S, T> StorageProvider<K, S> for Arc<T>
where
    K: 'static,
    S: 'static,
    T: StorageProvider<K, S> + ?Sized,
{
    fn get_storage(&self, partition: &PartitionId) -> Option<Arc<dyn CrdtStorage<K, S>>> {
        (**self).get_storage(partition)
    }
}

#[derive(Clone)]
/// The sharder of a single group with its indices translated into scheme indices.
pub(crate) struct GroupSharder {
    sharder: RendezvousHashSharder<PartitionId>,
    /// Scheme index of each group local stable index.
    global: Vec<usize>,
    repartition: bool,
    active: bool,
}

impl GroupSharder {
    #[inline]
    fn bucket(&self, bucket: usize) -> impl Iterator<Item = usize> + '_ {
        self.sharder
            .shard_bucket(bucket)
            .iter()
            .map(|local| self.global[*local])
    }

    /// The buckets holding every distinct replica set of the group.
    fn distinct_buckets(&self) -> std::ops::Range<usize> {
        let num_buckets = if self.sharder.is_predefined() {
            1
        } else {
            NUMBER_OF_BUCKETS
        };
        0..num_buckets
    }

    fn satisfies(&self, unhealthy: &BTreeSet<usize>, quorum: Quorum) -> bool {
        self.distinct_buckets()
            .all(|bucket| self.bucket_satisfies(bucket, unhealthy, quorum))
    }

    fn bucket_satisfies(
        &self,
        bucket: usize,
        unhealthy: &BTreeSet<usize>,
        quorum: Quorum,
    ) -> bool {
        let replicas = self.sharder.shard_bucket(bucket).len();
        let healthy = self
            .bucket(bucket)
            .filter(|index| !unhealthy.contains(index))
            .count();
        quorum.is_satisfied(healthy, replicas)
    }
}

/// The configured layout of the cluster.
///
/// A scheme is immutable, changes to the cluster membership are published
/// as a new scheme via a [crate::DiscoveryService].
pub struct PartitionScheme<K, S> {
    groups: Vec<PartitionGroup>,
    partitions: Vec<PartitionId>,
    provider: Arc<dyn StorageProvider<K, S>>,
    base: Vec<GroupSharder>,
}

impl<K, S> Debug for PartitionScheme<K, S>
where
    K: 'static,
    S: 'static,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionScheme")
            .field("groups", &self.groups)
            .finish()
    }
}

impl<K, S> PartitionScheme<K, S>
where
    K: 'static,
    S: 'static,
{
    /// Creates a new scheme ranking partitions by their `(group, id)` identity.
    pub fn new(
        groups: Vec<PartitionGroup>,
        provider: impl StorageProvider<K, S>,
    ) -> Result<Self, ConfigError> {
        Self::new_with_hasher(
            groups,
            provider,
            Arc::new(|partition: &PartitionId| partition.identity_hash()),
        )
    }

    /// Creates a new scheme using a custom partition hash.
    ///
    /// Hashing by [PartitionId::id_hash] makes groups whose partitions share
    /// ids route each key to the same id within every group.
    pub fn new_with_hasher(
        groups: Vec<PartitionGroup>,
        provider: impl StorageProvider<K, S>,
        hash_fn: PartitionHashFn,
    ) -> Result<Self, ConfigError> {
        if groups.is_empty() {
            return Err(ConfigError::InvalidGroup(
                "At least one partition group is required".to_string(),
            ));
        }

        for (i, group) in groups.iter().enumerate() {
            if group.partitions.is_empty() {
                return Err(ConfigError::InvalidGroup(format!(
                    "Partition group {} has no partitions",
                    i
                )));
            }
            if group.replicas == 0 {
                return Err(ConfigError::InvalidGroup(format!(
                    "Partition group {} must have at least one replica",
                    i
                )));
            }
        }

        let partitions = groups
            .iter()
            .flat_map(|group| group.partitions.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let base = groups
            .iter()
            .map(|group| {
                let sharder = RendezvousHashSharder::create(
                    group.partitions.iter().cloned(),
                    group.replicas,
                    |partition| hash_fn(partition),
                );
                let global = sharder
                    .partitions()
                    .map(|partition| {
                        partitions
                            .binary_search(partition)
                            .unwrap_or_default()
                    })
                    .collect();

                GroupSharder {
                    sharder,
                    global,
                    repartition: group.repartition,
                    active: group.active,
                }
            })
            .collect();

        Ok(Self {
            groups,
            partitions,
            provider: Arc::new(provider),
            base,
        })
    }

    pub fn groups(&self) -> &[PartitionGroup] {
        &self.groups
    }

    /// Every partition of every group in sorted order.
    ///
    /// The position of a partition in this list is its scheme index.
    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn partition(&self, index: usize) -> Option<&PartitionId> {
        self.partitions.get(index)
    }

    /// The scheme index of a partition.
    pub fn index_of(&self, partition: &PartitionId) -> Result<usize, ClusterError> {
        self.partitions.binary_search(partition).map_err(|_| {
            ClusterError::NotFound(format!("Partition {} is not part of the scheme", partition))
        })
    }

    /// The storage client of a partition.
    pub fn client(&self, partition: &PartitionId) -> Option<Arc<dyn CrdtStorage<K, S>>> {
        self.provider.get_storage(partition)
    }

    /// Creates a sharder routing writes to the alive partitions of
    /// every active group.
    ///
    /// Returns `None` if there is no active group or an active group
    /// has no alive partitions.
    pub fn create_sharder(&self, alive: &BTreeSet<PartitionId>) -> Option<SchemeSharder> {
        let mut groups = Vec::new();
        for (group, base) in self.groups.iter().zip(self.base.iter()) {
            if !group.active {
                continue;
            }

            if !group.partitions.iter().any(|p| alive.contains(p)) {
                return None;
            }

            let mut sharder = base.clone();
            if sharder.repartition {
                sharder.sharder.recompute(alive);
            }
            groups.push(sharder);
        }

        if groups.is_empty() {
            return None;
        }

        Some(SchemeSharder { groups })
    }

    /// If a read can observe every key while the given partitions are unhealthy.
    ///
    /// This holds when at least one active group, or any group if none are
    /// active, keeps a quorum of healthy replicas for every one of its buckets.
    pub fn is_read_valid(&self, unhealthy: &BTreeSet<usize>, quorum: Quorum) -> bool {
        let has_active = self.base.iter().any(|group| group.active);
        self.base
            .iter()
            .filter(|group| group.active || !has_active)
            .any(|group| group.satisfies(unhealthy, quorum))
    }

    /// If every group keeps a quorum of healthy replicas for every bucket.
    pub fn is_healthy(&self, unhealthy: &BTreeSet<usize>, quorum: Quorum) -> bool {
        self.base
            .iter()
            .all(|group| group.satisfies(unhealthy, quorum))
    }
}

#[derive(Clone)]
/// Routes keys to partitions of every active group.
pub struct SchemeSharder {
    groups: Vec<GroupSharder>,
}

impl SchemeSharder {
    /// The scheme indices of every partition the key hash is written to.
    ///
    /// Replica sets of each group are concatenated in group order,
    /// a partition appearing in several groups is only listed once.
    pub fn shard(&self, key_hash: u32) -> ReplicaSet {
        let bucket = crate::sharder::bucket_of(key_hash);
        let mut replicas = ReplicaSet::new();
        for group in self.groups.iter() {
            for index in group.bucket(bucket) {
                if !replicas.contains(&index) {
                    replicas.push(index);
                }
            }
        }
        replicas
    }

    /// If every bucket written to still has a quorum of replicas
    /// which have not failed, in every group.
    pub fn is_write_satisfied(
        &self,
        failed: &BTreeSet<usize>,
        buckets: &BucketSet,
        quorum: Quorum,
    ) -> bool {
        self.groups.iter().all(|group| {
            if group.sharder.is_predefined() {
                return buckets.is_empty() || group.bucket_satisfies(0, failed, quorum);
            }

            buckets
                .iter()
                .all(|bucket| group.bucket_satisfies(bucket, failed, quorum))
        })
    }

    /// The number of active groups writes are routed to.
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }
}
