use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the cluster storage.
///
/// The statistics are shared between every clone, pass a clone into
/// [crate::ClusterOptions] to observe a cluster from the outside.
pub struct ClusterStatistics(Arc<ClusterStatisticsInner>);

impl Deref for ClusterStatistics {
    type Target = ClusterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ClusterStatisticsInner {
    pub(crate) num_uploads: Counter,
    pub(crate) num_failed_uploads: Counter,
    pub(crate) num_downloads: Counter,
    pub(crate) num_failed_downloads: Counter,
    pub(crate) num_takes: Counter,
    pub(crate) num_pings: Counter,
    pub(crate) num_partition_failures: Counter,
    pub(crate) num_sharder_rebuilds: Counter,
    pub(crate) num_alive_partitions: Counter,
    pub(crate) num_dead_partitions: Counter,
}

impl ClusterStatisticsInner {
    /// The number of uploads started.
    pub fn num_uploads(&self) -> u64 {
        self.num_uploads.load(Ordering::Relaxed)
    }

    /// The number of uploads which failed to meet their quorum.
    pub fn num_failed_uploads(&self) -> u64 {
        self.num_failed_uploads.load(Ordering::Relaxed)
    }

    /// The number of downloads started.
    pub fn num_downloads(&self) -> u64 {
        self.num_downloads.load(Ordering::Relaxed)
    }

    /// The number of downloads which failed to meet their quorum.
    pub fn num_failed_downloads(&self) -> u64 {
        self.num_failed_downloads.load(Ordering::Relaxed)
    }

    /// The number of takes started.
    pub fn num_takes(&self) -> u64 {
        self.num_takes.load(Ordering::Relaxed)
    }

    /// The number of cluster wide pings.
    pub fn num_pings(&self) -> u64 {
        self.num_pings.load(Ordering::Relaxed)
    }

    /// The number of individual partition failures observed by any operation.
    pub fn num_partition_failures(&self) -> u64 {
        self.num_partition_failures.load(Ordering::Relaxed)
    }

    /// The number of times the sharder has been rebuilt due to topology changes.
    pub fn num_sharder_rebuilds(&self) -> u64 {
        self.num_sharder_rebuilds.load(Ordering::Relaxed)
    }

    /// The number of partitions currently believed to be alive.
    pub fn num_alive_partitions(&self) -> u64 {
        self.num_alive_partitions.load(Ordering::Relaxed)
    }

    /// The number of partitions currently believed to be dead.
    pub fn num_dead_partitions(&self) -> u64 {
        self.num_dead_partitions.load(Ordering::Relaxed)
    }

    pub(crate) fn incr(counter: &Counter) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set(counter: &Counter, value: usize) {
        counter.store(value as u64, Ordering::Relaxed);
    }
}
