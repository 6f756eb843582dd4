use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::scheme::{PartitionScheme, SchemeSharder};
use crate::statistics::{ClusterStatistics, ClusterStatisticsInner};
use crate::PartitionId;

/// An immutable view of the cluster used by a single operation.
pub(crate) struct Topology<K, S> {
    pub(crate) scheme: Arc<PartitionScheme<K, S>>,
    pub(crate) alive: BTreeSet<PartitionId>,
    /// `None` if writes cannot be routed anywhere.
    pub(crate) sharder: Option<Arc<SchemeSharder>>,
}

impl<K, S> Topology<K, S>
where
    K: 'static,
    S: 'static,
{
    fn new(scheme: Arc<PartitionScheme<K, S>>, alive: BTreeSet<PartitionId>) -> Self {
        let sharder = scheme.create_sharder(&alive).map(Arc::new);
        Self {
            scheme,
            alive,
            sharder,
        }
    }

    /// The scheme indices of every alive partition.
    pub(crate) fn alive_indices(&self) -> Vec<usize> {
        self.scheme
            .partitions()
            .iter()
            .enumerate()
            .filter(|(_, partition)| self.alive.contains(*partition))
            .map(|(index, _)| index)
            .collect()
    }

    /// The scheme indices of every dead partition.
    pub(crate) fn dead_indices(&self) -> BTreeSet<usize> {
        self.scheme
            .partitions()
            .iter()
            .enumerate()
            .filter(|(_, partition)| !self.alive.contains(*partition))
            .map(|(index, _)| index)
            .collect()
    }

    pub(crate) fn dead(&self) -> Vec<PartitionId> {
        self.scheme
            .partitions()
            .iter()
            .filter(|partition| !self.alive.contains(*partition))
            .cloned()
            .collect()
    }
}

/// The current topology, replaced wholesale whenever membership changes.
pub(crate) struct TopologyHandle<K, S> {
    current: RwLock<Arc<Topology<K, S>>>,
    statistics: ClusterStatistics,
}

impl<K, S> TopologyHandle<K, S>
where
    K: 'static,
    S: 'static,
{
    pub(crate) fn new(
        scheme: Arc<PartitionScheme<K, S>>,
        statistics: ClusterStatistics,
    ) -> Self {
        let topology = Self::fresh(scheme);
        record_membership(&statistics, &topology);
        Self {
            current: RwLock::new(Arc::new(topology)),
            statistics,
        }
    }

    fn fresh(scheme: Arc<PartitionScheme<K, S>>) -> Topology<K, S> {
        let alive = scheme.partitions().iter().cloned().collect();
        Topology::new(scheme, alive)
    }

    pub(crate) fn statistics(&self) -> &ClusterStatistics {
        &self.statistics
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> Arc<Topology<K, S>> {
        self.current.read().clone()
    }

    /// Replaces the scheme, considering every partition alive.
    pub(crate) fn install(&self, scheme: Arc<PartitionScheme<K, S>>) {
        let topology = Self::fresh(scheme);
        record_membership(&self.statistics, &topology);
        ClusterStatisticsInner::incr(&self.statistics.num_sharder_rebuilds);
        *self.current.write() = Arc::new(topology);
    }

    /// Marks the partitions as dead, rebuilding the sharder if anything changed.
    pub(crate) fn mark_dead<'a>(
        &self,
        partitions: impl IntoIterator<Item = &'a PartitionId>,
    ) -> bool {
        self.update(|alive| {
            let mut changed = false;
            for partition in partitions {
                if alive.remove(partition) {
                    warn!(partition = %partition, "Marking partition as dead.");
                    changed = true;
                }
            }
            changed
        })
    }

    /// Marks the partitions as alive, rebuilding the sharder if anything changed.
    ///
    /// Partitions which are not part of the current scheme are ignored.
    pub(crate) fn mark_alive<'a>(
        &self,
        partitions: impl IntoIterator<Item = &'a PartitionId>,
    ) -> bool {
        let mut lock = self.current.write();
        let scheme = lock.scheme.clone();
        let mut alive = lock.alive.clone();

        let mut changed = false;
        for partition in partitions {
            if scheme.index_of(partition).is_ok() && alive.insert(partition.clone()) {
                info!(partition = %partition, "Partition is alive again.");
                changed = true;
            }
        }

        if changed {
            self.replace(&mut lock, scheme, alive);
        }
        changed
    }

    fn update(&self, mutate: impl FnOnce(&mut BTreeSet<PartitionId>) -> bool) -> bool {
        let mut lock = self.current.write();
        let mut alive = lock.alive.clone();
        if !mutate(&mut alive) {
            return false;
        }

        let scheme = lock.scheme.clone();
        self.replace(&mut lock, scheme, alive);
        true
    }

    fn replace(
        &self,
        current: &mut Arc<Topology<K, S>>,
        scheme: Arc<PartitionScheme<K, S>>,
        alive: BTreeSet<PartitionId>,
    ) {
        let topology = Topology::new(scheme, alive);
        record_membership(&self.statistics, &topology);
        ClusterStatisticsInner::incr(&self.statistics.num_sharder_rebuilds);
        *current = Arc::new(topology);
    }
}

fn record_membership<K, S>(statistics: &ClusterStatistics, topology: &Topology<K, S>)
where
    K: 'static,
    S: 'static,
{
    let total = topology.scheme.partitions().len();
    ClusterStatisticsInner::set(&statistics.num_alive_partitions, topology.alive.len());
    ClusterStatisticsInner::set(
        &statistics.num_dead_partitions,
        total - topology.alive.len(),
    );
}
