use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crdtcake_crdt::CrdtData;
use crdtcake_storage::{CrdtStream, StorageError};
use futures::{stream, StreamExt};
use tokio::task::JoinHandle;

use crate::error::{ClusterError, FailedPartitions};
use crate::quorum::ClusterOptions;
use crate::sharder::{bucket_of, BucketSet};
use crate::statistics::ClusterStatisticsInner;
use crate::topology::{Topology, TopologyHandle};
use crate::{ClusterKey, ClusterState};

/// A message sent to a partition's upload session.
pub(crate) enum Frame<K, S> {
    Entry(CrdtData<K, S>),
    /// The upload completed, anything else ending the channel is an abort.
    End,
}

/// Converts the receiving end of an upload session into the stream
/// handed to the partition's storage.
///
/// If the sender is dropped before [Frame::End] is sent the stream
/// yields an error, causing the storage to discard the upload.
pub(crate) fn frames_to_entries<K, S>(rx: flume::Receiver<Frame<K, S>>) -> CrdtStream<K, S>
where
    K: Send + 'static,
    S: Send + 'static,
{
    stream::unfold(Some(rx), |rx| async move {
        let rx = rx?;
        match rx.recv_async().await {
            Ok(Frame::Entry(entry)) => Some((Ok(entry), Some(rx))),
            Ok(Frame::End) => None,
            Err(_) => Some((
                Err(StorageError::Aborted("The upload was cancelled".to_string())),
                None,
            )),
        }
    })
    .boxed()
}

/// The open upload sessions of a single cluster upload.
///
/// Dropping the sessions aborts every session which has not completed.
struct UploadSessions<K, S> {
    capacity: usize,
    senders: BTreeMap<usize, flume::Sender<Frame<K, S>>>,
    handles: BTreeMap<usize, JoinHandle<Result<(), StorageError>>>,
}

impl<K, S> UploadSessions<K, S>
where
    K: ClusterKey,
    S: ClusterState,
{
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            senders: BTreeMap::new(),
            handles: BTreeMap::new(),
        }
    }

    /// The sender of a partition's session, opening the session if required.
    fn sender(
        &mut self,
        index: usize,
        topology: &Topology<K, S>,
    ) -> Result<&flume::Sender<Frame<K, S>>, StorageError> {
        match self.senders.entry(index) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let partition = topology.scheme.partition(index).ok_or_else(|| {
                    StorageError::Unavailable(format!("Unknown partition index {}", index))
                })?;

                if !topology.alive.contains(partition) {
                    return Err(StorageError::Unavailable(format!(
                        "Partition {} is dead",
                        partition
                    )));
                }

                let client = topology.scheme.client(partition).ok_or_else(|| {
                    StorageError::Unavailable(format!(
                        "No storage client for partition {}",
                        partition
                    ))
                })?;

                let (tx, rx) = flume::bounded(self.capacity);
                let handle =
                    tokio::spawn(async move { client.upload(frames_to_entries(rx)).await });
                self.handles.insert(index, handle);

                debug!(partition = %partition, "Opened upload session.");
                Ok(entry.insert(tx))
            },
        }
    }

    fn targeted(&self) -> impl Iterator<Item = usize> + '_ {
        self.handles.keys().copied()
    }

    /// Completes every session, returning the result of each.
    async fn finish(&mut self) -> Vec<(usize, Result<(), StorageError>)> {
        for tx in std::mem::take(&mut self.senders).into_values() {
            let _ = tx.send_async(Frame::End).await;
        }

        let mut results = Vec::with_capacity(self.handles.len());
        for (index, handle) in std::mem::take(&mut self.handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(StorageError::Aborted(e.to_string())),
            };
            results.push((index, result));
        }
        results
    }
}

impl<K, S> Drop for UploadSessions<K, S> {
    fn drop(&mut self) {
        for handle in self.handles.values() {
            handle.abort();
        }
    }
}

#[instrument(name = "cluster-upload", skip_all)]
/// Uploads the entries to the replica set of each key.
pub(crate) async fn upload<K, S>(
    handle: &Arc<TopologyHandle<K, S>>,
    options: &ClusterOptions,
    mut entries: CrdtStream<K, S>,
) -> Result<(), ClusterError>
where
    K: ClusterKey,
    S: ClusterState,
{
    let statistics = handle.statistics();
    ClusterStatisticsInner::incr(&statistics.num_uploads);

    let topology = handle.snapshot();
    let sharder = topology
        .sharder
        .clone()
        .ok_or(ClusterError::NoSendersAvailable)?;
    let quorum = options.upload_quorum;

    let mut sessions = UploadSessions::new(options.channel_capacity);
    let mut failed = BTreeSet::new();
    let mut buckets = BucketSet::default();

    while let Some(entry) = entries.next().await {
        let entry = entry.map_err(|e| {
            error!(error = ?e, "Upload source failed, aborting sessions.");
            ClusterError::Source(e)
        })?;

        let key_hash = crate::hash32(&entry.key);
        buckets.insert(bucket_of(key_hash));

        let mut new_failure = false;
        for index in sharder.shard(key_hash) {
            if failed.contains(&index) {
                continue;
            }

            let result = match sessions.sender(index, &topology) {
                Ok(tx) => tx
                    .send_async(Frame::Entry(entry.clone()))
                    .await
                    .map_err(|_| StorageError::Unavailable("Session closed".to_string())),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(partition_index = index, error = %e, "Partition failed during upload.");
                failed.insert(index);
                new_failure = true;
            }
        }

        if new_failure && !sharder.is_write_satisfied(&failed, &buckets, quorum) {
            let mut targeted = sessions.targeted().collect::<BTreeSet<_>>();
            targeted.extend(failed.iter().copied());
            return Err(upload_failed(handle, &topology, &failed, targeted.len()));
        }
    }

    let mut targeted = sessions.targeted().collect::<BTreeSet<_>>();
    for (index, result) in sessions.finish().await {
        if let Err(e) = result {
            if failed.insert(index) {
                warn!(partition_index = index, error = %e, "Partition failed to complete upload.");
            } else {
                debug!(partition_index = index, error = %e, "Failed session completed.");
            }
        }
    }
    targeted.extend(failed.iter().copied());

    if !sharder.is_write_satisfied(&failed, &buckets, quorum) {
        return Err(upload_failed(handle, &topology, &failed, targeted.len()));
    }

    if !failed.is_empty() {
        record_failures(handle, &topology, &failed);
        info!(
            num_failed = failed.len(),
            num_partitions = targeted.len(),
            "Upload met its quorum despite partition failures.",
        );
    }

    Ok(())
}

fn upload_failed<K, S>(
    handle: &TopologyHandle<K, S>,
    topology: &Topology<K, S>,
    failed: &BTreeSet<usize>,
    total: usize,
) -> ClusterError
where
    K: 'static,
    S: 'static,
{
    ClusterStatisticsInner::incr(&handle.statistics().num_failed_uploads);
    let failed = record_failures(handle, topology, failed);
    let error = ClusterError::UploadFailed(FailedPartitions::new(failed, total));
    error!(error = %error, "Upload could not meet its quorum.");
    error
}

/// Marks the failed partitions dead, returning their identities.
pub(crate) fn record_failures<K, S>(
    handle: &TopologyHandle<K, S>,
    topology: &Topology<K, S>,
    failed: &BTreeSet<usize>,
) -> Vec<crate::PartitionId>
where
    K: 'static,
    S: 'static,
{
    let partitions = failed
        .iter()
        .filter_map(|index| topology.scheme.partition(*index))
        .cloned()
        .collect::<Vec<_>>();

    let statistics = handle.statistics();
    for _ in 0..partitions.len() {
        ClusterStatisticsInner::incr(&statistics.num_partition_failures);
    }
    handle.mark_dead(partitions.iter());
    partitions
}
