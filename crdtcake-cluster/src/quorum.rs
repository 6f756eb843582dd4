use crate::statistics::ClusterStatistics;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The number of partitions out of a replica set which must succeed
/// for an operation to be considered successful.
pub enum Quorum {
    /// A single partition is enough.
    One,
    /// More than half of the replica set.
    Majority,
    /// Every partition in the replica set.
    All,
    /// At least `n` partitions, capped at the size of the replica set.
    AtLeast(usize),
}

impl Quorum {
    /// The number of successful partitions required out of `replicas`.
    ///
    /// This is never zero unless the replica set is empty.
    pub fn required(&self, replicas: usize) -> usize {
        let required = match self {
            Quorum::One => 1,
            Quorum::Majority => (replicas / 2) + 1,
            Quorum::All => replicas,
            Quorum::AtLeast(n) => *n,
        };

        required.max(1).min(replicas)
    }

    /// If `healthy` partitions out of `replicas` satisfies the quorum.
    pub fn is_satisfied(&self, healthy: usize, replicas: usize) -> bool {
        healthy >= self.required(replicas)
    }
}

#[derive(Debug, Clone)]
/// Tuning of the cluster storage.
pub struct ClusterOptions {
    /// The threshold a replica set must meet for an upload to succeed.
    pub upload_quorum: Quorum,
    /// The threshold required to guarantee a download observed every key.
    pub download_quorum: Quorum,
    /// The threshold required for a cluster wide ping to succeed.
    pub ping_quorum: Quorum,
    /// The capacity of the channel feeding each partition's upload session.
    pub channel_capacity: usize,
    /// The sink live metrics are recorded into.
    pub statistics: ClusterStatistics,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            upload_quorum: Quorum::Majority,
            download_quorum: Quorum::Majority,
            ping_quorum: Quorum::All,
            channel_capacity: 1024,
            statistics: ClusterStatistics::default(),
        }
    }
}

impl ClusterOptions {
    pub fn with_upload_quorum(mut self, quorum: Quorum) -> Self {
        self.upload_quorum = quorum;
        self
    }

    pub fn with_download_quorum(mut self, quorum: Quorum) -> Self {
        self.download_quorum = quorum;
        self
    }

    pub fn with_ping_quorum(mut self, quorum: Quorum) -> Self {
        self.ping_quorum = quorum;
        self
    }

    /// Sets the channel capacity of the upload sessions.
    ///
    /// A capacity of zero is bumped to one.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_statistics(mut self, statistics: ClusterStatistics) -> Self {
        self.statistics = statistics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required() {
        assert_eq!(Quorum::One.required(3), 1);
        assert_eq!(Quorum::Majority.required(1), 1);
        assert_eq!(Quorum::Majority.required(2), 2);
        assert_eq!(Quorum::Majority.required(3), 2);
        assert_eq!(Quorum::Majority.required(5), 3);
        assert_eq!(Quorum::All.required(4), 4);
        assert_eq!(Quorum::AtLeast(2).required(3), 2);
        assert_eq!(Quorum::AtLeast(5).required(3), 3);
        assert_eq!(Quorum::AtLeast(0).required(3), 1);
        assert_eq!(Quorum::All.required(0), 0);
    }

    #[test]
    fn test_is_satisfied() {
        assert!(Quorum::AtLeast(2).is_satisfied(2, 3));
        assert!(!Quorum::AtLeast(2).is_satisfied(1, 3));
        assert!(Quorum::One.is_satisfied(1, 5));
        assert!(!Quorum::All.is_satisfied(4, 5));
    }

    #[test]
    fn test_options() {
        let options = ClusterOptions::default()
            .with_upload_quorum(Quorum::All)
            .with_channel_capacity(0);
        assert_eq!(options.upload_quorum, Quorum::All);
        assert_eq!(options.download_quorum, Quorum::Majority);
        assert_eq!(options.ping_quorum, Quorum::All);
        assert_eq!(options.channel_capacity, 1);
    }
}
