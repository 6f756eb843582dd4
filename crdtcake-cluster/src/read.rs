use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use crdtcake_crdt::{CrdtData, CrdtFunction};
use crdtcake_storage::{CrdtStorage, StorageError, Take, TakeCommit};
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;

use crate::error::{ClusterError, FailedPartitions};
use crate::merge::{ClusterStream, MergeOutcome, MergeState, ReadKind};
use crate::quorum::ClusterOptions;
use crate::statistics::ClusterStatisticsInner;
use crate::topology::{Topology, TopologyHandle};
use crate::upload::record_failures;
use crate::{ClusterKey, ClusterState, PartitionId};

/// Opens a read against every alive partition concurrently.
///
/// Returns the opened partitions alongside the scheme indices of every
/// partition which is dead or failed to open.
async fn open_partitions<K, S, T, F, Fut>(
    topology: &Topology<K, S>,
    open: F,
) -> (Vec<(usize, T)>, BTreeSet<usize>, BTreeSet<usize>)
where
    K: 'static,
    S: 'static,
    F: Fn(Arc<dyn CrdtStorage<K, S>>) -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let unhealthy = topology.dead_indices();
    let mut failed = BTreeSet::new();
    let mut pending = FuturesUnordered::new();

    for index in topology.alive_indices() {
        let client = topology
            .scheme
            .partition(index)
            .and_then(|partition| topology.scheme.client(partition));

        match client {
            Some(client) => {
                let fut = open(client);
                pending.push(async move { (index, fut.await) });
            },
            None => {
                warn!(partition_index = index, "No storage client for partition.");
                failed.insert(index);
            },
        }
    }

    let mut opened = Vec::new();
    while let Some((index, result)) = pending.next().await {
        match result {
            Ok(value) => opened.push((index, value)),
            Err(e) => {
                warn!(
                    partition = ?topology.scheme.partition(index),
                    error = %e,
                    "Failed to open partition for reading.",
                );
                failed.insert(index);
            },
        }
    }
    opened.sort_by_key(|(index, _)| *index);

    (opened, unhealthy, failed)
}

fn read_failed<K, S>(
    kind: ReadKind,
    topology: &Topology<K, S>,
    unhealthy: &BTreeSet<usize>,
) -> ClusterError
where
    K: 'static,
    S: 'static,
{
    let failed = unhealthy
        .iter()
        .filter_map(|index| topology.scheme.partition(*index))
        .cloned();
    let error = kind.failed(FailedPartitions::new(failed, topology.scheme.partitions().len()));
    error!(error = %error, "Not enough healthy partitions to read every key.");
    error
}

#[instrument(name = "cluster-download", skip(handle, function, options))]
/// Downloads every entry modified at or after `timestamp`, merged across partitions.
pub(crate) async fn download<K, S>(
    handle: &Arc<TopologyHandle<K, S>>,
    function: &Arc<dyn CrdtFunction<S>>,
    options: &ClusterOptions,
    timestamp: u64,
) -> Result<ClusterStream<K, S>, ClusterError>
where
    K: ClusterKey,
    S: ClusterState,
{
    let statistics = handle.statistics();
    ClusterStatisticsInner::incr(&statistics.num_downloads);

    let topology = handle.snapshot();
    let quorum = options.download_quorum;

    if !topology.scheme.is_read_valid(&topology.dead_indices(), quorum) {
        ClusterStatisticsInner::incr(&statistics.num_failed_downloads);
        return Err(read_failed(ReadKind::Download, &topology, &topology.dead_indices()));
    }

    let (sources, mut unhealthy, failed) =
        open_partitions(&topology, |client| async move { client.download(timestamp).await })
            .await;

    if !failed.is_empty() {
        record_failures(handle, &topology, &failed);
        unhealthy.extend(failed);
    }

    if !topology.scheme.is_read_valid(&unhealthy, quorum) {
        ClusterStatisticsInner::incr(&statistics.num_failed_downloads);
        return Err(read_failed(ReadKind::Download, &topology, &unhealthy));
    }

    debug!(num_partitions = sources.len(), "Merging partition downloads.");

    let failed_downloads = statistics.clone();
    let merge = MergeState::new(
        sources,
        function.clone(),
        unhealthy,
        quorum,
        ReadKind::Download,
        topology,
        handle.clone(),
        Arc::new(Mutex::new(MergeOutcome::default())),
    );

    let stream = merge.into_stream().inspect_err(move |_| {
        ClusterStatisticsInner::incr(&failed_downloads.num_failed_downloads);
    });
    Ok(stream.boxed())
}

/// The merged entries of a cluster wide take.
///
/// The entries stay in the cluster until [ClusterTakeCommit::commit] is called.
pub struct ClusterTake<K, S> {
    entries: ClusterStream<K, S>,
    commit: ClusterTakeCommit,
}

impl<K, S> ClusterTake<K, S>
where
    K: Send + 'static,
    S: Send + 'static,
{
    pub fn into_parts(self) -> (ClusterStream<K, S>, ClusterTakeCommit) {
        (self.entries, self.commit)
    }

    /// Drains the merged entries and commits the take.
    pub async fn collect_and_commit(self) -> Result<Vec<CrdtData<K, S>>, ClusterError> {
        let entries = self.entries.try_collect::<Vec<_>>().await?;
        self.commit.commit().await?;
        Ok(entries)
    }
}

/// Removes taken entries from the partitions they were read from.
pub struct ClusterTakeCommit {
    commits: Vec<(usize, PartitionId, Box<dyn TakeCommit>)>,
    outcome: Arc<Mutex<MergeOutcome>>,
}

impl ClusterTakeCommit {
    /// Commits the take on every partition whose entries were fully consumed.
    ///
    /// Partitions which failed, or whose stream was not read to the end,
    /// keep their data. Returns the number of partitions committed.
    pub async fn commit(self) -> Result<usize, ClusterError> {
        let completed = self.outcome.lock().completed.clone();

        let mut pending = Vec::new();
        for (index, partition, commit) in self.commits {
            if completed.contains(&index) {
                pending.push(async move { (partition, commit.commit().await) });
            } else {
                debug!(partition = %partition, "Partition was not fully read, keeping its entries.");
            }
        }

        let total = pending.len();
        let mut failed = Vec::new();
        for (partition, result) in join_all(pending).await {
            if let Err(e) = result {
                warn!(partition = %partition, error = %e, "Failed to commit take.");
                failed.push(partition);
            }
        }

        if !failed.is_empty() {
            let error = ClusterError::TakeFailed(FailedPartitions::new(failed, total));
            error!(error = %error, "Take commit failed on some partitions.");
            return Err(error);
        }

        Ok(total)
    }
}

#[instrument(name = "cluster-take", skip_all)]
/// Takes a merged snapshot of every partition.
pub(crate) async fn take<K, S>(
    handle: &Arc<TopologyHandle<K, S>>,
    function: &Arc<dyn CrdtFunction<S>>,
    options: &ClusterOptions,
) -> Result<ClusterTake<K, S>, ClusterError>
where
    K: ClusterKey,
    S: ClusterState,
{
    ClusterStatisticsInner::incr(&handle.statistics().num_takes);

    let topology = handle.snapshot();
    let quorum = options.download_quorum;

    if !topology.scheme.is_read_valid(&topology.dead_indices(), quorum) {
        return Err(read_failed(ReadKind::Take, &topology, &topology.dead_indices()));
    }

    let (takes, mut unhealthy, failed) =
        open_partitions(&topology, |client| async move { client.take().await }).await;

    if !failed.is_empty() {
        record_failures(handle, &topology, &failed);
        unhealthy.extend(failed);
    }

    if !topology.scheme.is_read_valid(&unhealthy, quorum) {
        return Err(read_failed(ReadKind::Take, &topology, &unhealthy));
    }

    let mut sources = Vec::with_capacity(takes.len());
    let mut commits = Vec::with_capacity(takes.len());
    for (index, take) in takes {
        let (entries, commit): (_, Box<dyn TakeCommit>) = Take::into_parts(take);
        sources.push((index, entries));
        if let Some(partition) = topology.scheme.partition(index) {
            commits.push((index, partition.clone(), commit));
        }
    }

    let outcome = Arc::new(Mutex::new(MergeOutcome::default()));
    let merge = MergeState::new(
        sources,
        function.clone(),
        unhealthy,
        quorum,
        ReadKind::Take,
        topology,
        handle.clone(),
        outcome.clone(),
    );

    Ok(ClusterTake {
        entries: merge.into_stream(),
        commit: ClusterTakeCommit { commits, outcome },
    })
}
