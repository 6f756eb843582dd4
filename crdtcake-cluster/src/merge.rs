use std::collections::BTreeSet;
use std::sync::Arc;

use crdtcake_crdt::{CrdtData, CrdtFunction};
use crdtcake_storage::{CrdtStream, StorageError};
use futures::future::join_all;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;

use crate::error::{ClusterError, FailedPartitions};
use crate::quorum::Quorum;
use crate::topology::{Topology, TopologyHandle};
use crate::upload::record_failures;
use crate::{ClusterKey, ClusterState};

/// A stream of merged entries produced by the cluster.
pub type ClusterStream<K, S> = BoxStream<'static, Result<CrdtData<K, S>, ClusterError>>;

#[derive(Debug, Copy, Clone)]
pub(crate) enum ReadKind {
    Download,
    Take,
}

impl ReadKind {
    pub(crate) fn failed(self, failed: FailedPartitions) -> ClusterError {
        match self {
            ReadKind::Download => ClusterError::DownloadFailed(failed),
            ReadKind::Take => ClusterError::TakeFailed(failed),
        }
    }
}

#[derive(Debug, Default)]
/// What happened to each partition's stream during a merge.
pub(crate) struct MergeOutcome {
    /// Partitions whose stream was read to the end.
    pub(crate) completed: BTreeSet<usize>,
    /// Partitions whose stream failed part way through.
    pub(crate) failed: BTreeSet<usize>,
}

struct MergeSource<K, S> {
    index: usize,
    stream: CrdtStream<K, S>,
    head: Option<CrdtData<K, S>>,
    done: bool,
}

impl<K, S> MergeSource<K, S> {
    #[inline]
    fn needs_head(&self) -> bool {
        self.head.is_none() && !self.done
    }

    async fn advance(&mut self) -> Result<bool, StorageError> {
        match self.stream.next().await {
            Some(Ok(entry)) => {
                self.head = Some(entry);
                Ok(false)
            },
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            },
            None => {
                self.done = true;
                Ok(true)
            },
        }
    }
}

/// A streaming k-way merge of the sorted streams of several partitions.
///
/// Entries sharing a key are combined with the CRDT function. A partition
/// failing part way through is dropped from the merge as long as the
/// remaining partitions still hold every key, otherwise the merge ends
/// with an error.
pub(crate) struct MergeState<K, S> {
    sources: Vec<MergeSource<K, S>>,
    function: Arc<dyn CrdtFunction<S>>,
    unhealthy: BTreeSet<usize>,
    quorum: Quorum,
    kind: ReadKind,
    topology: Arc<Topology<K, S>>,
    handle: Arc<TopologyHandle<K, S>>,
    outcome: Arc<Mutex<MergeOutcome>>,
}

impl<K, S> MergeState<K, S>
where
    K: ClusterKey,
    S: ClusterState,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sources: Vec<(usize, CrdtStream<K, S>)>,
        function: Arc<dyn CrdtFunction<S>>,
        unhealthy: BTreeSet<usize>,
        quorum: Quorum,
        kind: ReadKind,
        topology: Arc<Topology<K, S>>,
        handle: Arc<TopologyHandle<K, S>>,
        outcome: Arc<Mutex<MergeOutcome>>,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|(index, stream)| MergeSource {
                index,
                stream,
                head: None,
                done: false,
            })
            .collect();

        Self {
            sources,
            function,
            unhealthy,
            quorum,
            kind,
            topology,
            handle,
            outcome,
        }
    }

    /// Converts the merge into a stream which ends after the first error.
    pub(crate) fn into_stream(self) -> ClusterStream<K, S> {
        stream::unfold(Some(self), |state| async move {
            let mut state = state?;
            match state.next_entry().await {
                Some(Ok(entry)) => Some((Ok(entry), Some(state))),
                Some(Err(e)) => Some((Err(e), None)),
                None => None,
            }
        })
        .boxed()
    }

    async fn next_entry(&mut self) -> Option<Result<CrdtData<K, S>, ClusterError>> {
        if let Err(e) = self.fill_heads().await {
            return Some(Err(e));
        }

        let min_key = self
            .sources
            .iter()
            .filter_map(|source| source.head.as_ref())
            .map(|head| &head.key)
            .min()?
            .clone();

        let function = &*self.function;
        let merged = self
            .sources
            .iter_mut()
            .filter(|source| {
                source
                    .head
                    .as_ref()
                    .map(|head| head.key == min_key)
                    .unwrap_or(false)
            })
            .filter_map(|source| source.head.take())
            .reduce(|acc, entry| acc.merge_with(entry, function));

        merged.map(Ok)
    }

    async fn fill_heads(&mut self) -> Result<(), ClusterError> {
        let results = join_all(
            self.sources
                .iter_mut()
                .filter(|source| source.needs_head())
                .map(|source| async move { (source.index, source.advance().await) }),
        )
        .await;

        let mut new_failures = BTreeSet::new();
        {
            let mut outcome = self.outcome.lock();
            for (index, result) in results {
                match result {
                    Ok(true) => {
                        outcome.completed.insert(index);
                    },
                    Ok(false) => {},
                    Err(e) => {
                        warn!(
                            partition = ?self.topology.scheme.partition(index),
                            error = %e,
                            "Partition failed part way through a {:?}.",
                            self.kind,
                        );
                        outcome.failed.insert(index);
                        new_failures.insert(index);
                    },
                }
            }
        }

        if new_failures.is_empty() {
            return Ok(());
        }

        record_failures(&self.handle, &self.topology, &new_failures);
        self.unhealthy.extend(new_failures);

        if !self.topology.scheme.is_read_valid(&self.unhealthy, self.quorum) {
            // Nothing else is read once the merge fails.
            for source in self.sources.iter_mut() {
                source.done = true;
                source.head = None;
            }

            let failed = self
                .unhealthy
                .iter()
                .filter_map(|index| self.topology.scheme.partition(*index))
                .cloned();
            let total = self.topology.scheme.partitions().len();
            let error = self.kind.failed(FailedPartitions::new(failed, total));
            error!(error = %error, "Too many partitions failed to complete the read.");
            return Err(error);
        }

        Ok(())
    }
}
