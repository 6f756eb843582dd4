use std::fmt::{self, Display, Formatter};

use crdtcake_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::PartitionId;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Malformed configuration: {0}")]
    /// The partition configuration could not be loaded.
    MalformedConfiguration(#[from] ConfigError),

    #[error("Partition {partition} is unavailable: {error}")]
    /// A single partition could not serve a request.
    ///
    /// These errors are aggregated by the cluster and only surface
    /// to callers via the `*Failed` variants.
    PartitionUnavailable {
        partition: PartitionId,
        error: StorageError,
    },

    #[error("Upload failed: {0}")]
    /// Too many partitions failed for the upload to be considered durable.
    ///
    /// Some partitions may still have stored the entries.
    UploadFailed(FailedPartitions),

    #[error("Download failed: {0}")]
    /// Too many partitions failed to guarantee no data was missed.
    DownloadFailed(FailedPartitions),

    #[error("Take failed: {0}")]
    TakeFailed(FailedPartitions),

    #[error("Ping failed: {0}")]
    PingFailed(FailedPartitions),

    #[error("{0}")]
    /// A partition or handler the operation relies on is not tracked.
    NotFound(String),

    #[error("No senders available")]
    /// The scheme could not resolve any partition to route the request to.
    NoSendersAvailable,

    #[error("The upload source failed: {0}")]
    /// The stream handed to the cluster produced an error.
    Source(StorageError),
}

impl ClusterError {
    /// The partitions which caused an aggregate failure.
    pub fn failed_partitions(&self) -> Option<&FailedPartitions> {
        match self {
            Self::UploadFailed(failed)
            | Self::DownloadFailed(failed)
            | Self::TakeFailed(failed)
            | Self::PingFailed(failed) => Some(failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The partitions which failed during an aggregate operation.
pub struct FailedPartitions {
    /// The partitions which failed, in sorted order.
    pub failed: Vec<PartitionId>,
    /// The number of partitions which took part in the operation.
    pub total: usize,
}

impl FailedPartitions {
    pub(crate) fn new(failed: impl IntoIterator<Item = PartitionId>, total: usize) -> Self {
        let mut failed = failed.into_iter().collect::<Vec<_>>();
        failed.sort();
        failed.dedup();
        Self { failed, total }
    }

    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Display for FailedPartitions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} partitions failed [", self.failed.len(), self.total)?;
        for (i, partition) in self.failed.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}/{}", partition.group(), partition.id())?;
        }
        write!(f, "]")
    }
}
