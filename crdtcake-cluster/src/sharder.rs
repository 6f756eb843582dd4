use std::collections::BTreeSet;
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::ClusterError;

/// The number of precomputed rendezvous buckets a key hash is masked into.
pub const NUMBER_OF_BUCKETS: usize = 1024;
const _: () = assert!(
    NUMBER_OF_BUCKETS.is_power_of_two(),
    "The number of buckets must be a power of two"
);
const BUCKET_MASK: u32 = (NUMBER_OF_BUCKETS - 1) as u32;

#[inline]
/// The bucket a key hash falls into.
pub fn bucket_of(key_hash: u32) -> usize {
    (key_hash & BUCKET_MASK) as usize
}

/// Mixes a partition hash with a bucket number.
///
/// This is the 64 bit murmur3 finalizer, the ranking of partitions for one
/// bucket tells nothing about their ranking for any other bucket.
pub(crate) fn combined_hash(partition_hash: u32, bucket: u32) -> u32 {
    let mut k = ((partition_hash as u64) << 32) | bucket as u64;
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    (k ^ (k >> 32)) as u32
}

#[derive(Debug, Clone)]
struct Slot<P> {
    partition: P,
    index: usize,
    hash: u32,
}

#[derive(Debug, Clone)]
/// Assigns keys to partitions using rendezvous (highest random weight) hashing.
///
/// Partitions are given a stable index in their sorted order when the sharder
/// is created. Removing partitions never renumbers the survivors, so results of
/// [RendezvousHashSharder::shard] stay comparable across membership changes.
///
/// For every one of the [NUMBER_OF_BUCKETS] buckets the `top_shards` highest
/// ranking partitions are precomputed, making each lookup a single table access.
/// If there are no more partitions than `top_shards` every key maps to every
/// partition and no table is built.
pub struct RendezvousHashSharder<P> {
    slots: Vec<Slot<P>>,
    top_shards: usize,
    /// `NUMBER_OF_BUCKETS * top_shards` indices, bucket after bucket.
    buckets: Vec<usize>,
    /// Every live index in stable order, set in place of the table when
    /// the partitions all fit into a single replica set.
    predefined: Option<Vec<usize>>,
}

impl<P> RendezvousHashSharder<P>
where
    P: Ord,
{
    /// Creates a new sharder over the given partitions.
    ///
    /// Duplicate partitions are only tracked once.
    pub fn create<F>(
        partitions: impl IntoIterator<Item = P>,
        top_shards: usize,
        hash_fn: F,
    ) -> Self
    where
        F: Fn(&P) -> u32,
    {
        let mut partitions = partitions.into_iter().collect::<Vec<_>>();
        partitions.sort();
        partitions.dedup();

        let slots = partitions
            .into_iter()
            .enumerate()
            .map(|(index, partition)| Slot {
                hash: hash_fn(&partition),
                partition,
                index,
            })
            .collect();

        let mut sharder = Self {
            slots,
            top_shards,
            buckets: Vec::new(),
            predefined: None,
        };
        sharder.refill_buckets();
        sharder
    }

    /// Drops every partition which is not within `alive`.
    ///
    /// The table is only rebuilt if a partition was actually removed, the
    /// return value reports if that happened. Rebuilding is expensive and
    /// should only happen on topology changes.
    pub fn recompute(&mut self, alive: &BTreeSet<P>) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| alive.contains(&slot.partition));

        if self.slots.len() == before {
            return false;
        }

        self.refill_buckets();
        true
    }

    fn refill_buckets(&mut self) {
        self.buckets.clear();

        if self.slots.len() <= self.top_shards {
            self.predefined = Some(self.slots.iter().map(|slot| slot.index).collect());
            return;
        }

        self.predefined = None;
        self.buckets.reserve(NUMBER_OF_BUCKETS * self.top_shards);

        let mut ranked = Vec::with_capacity(self.slots.len());
        for bucket in 0..NUMBER_OF_BUCKETS as u32 {
            ranked.clear();
            ranked.extend(
                self.slots
                    .iter()
                    .map(|slot| (combined_hash(slot.hash, bucket), slot.index)),
            );
            ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            self.buckets
                .extend(ranked.iter().take(self.top_shards).map(|(_, index)| *index));
        }
    }
}

impl<P> RendezvousHashSharder<P> {
    #[inline]
    /// The stable indices of the partitions owning the bucket.
    pub fn shard_bucket(&self, bucket: usize) -> &[usize] {
        if let Some(predefined) = self.predefined.as_ref() {
            return predefined;
        }

        let start = bucket * self.top_shards;
        &self.buckets[start..start + self.top_shards]
    }

    #[inline]
    /// The stable indices of the partitions owning the key hash.
    pub fn shard_hash(&self, key_hash: u32) -> &[usize] {
        self.shard_bucket(bucket_of(key_hash))
    }

    /// The stable indices of the partitions owning the key.
    pub fn shard<K: Hash + ?Sized>(&self, key: &K) -> &[usize] {
        self.shard_hash(crate::hash32(key))
    }

    /// The partition tracked under the given stable index.
    pub fn partition(&self, index: usize) -> Option<&P> {
        self.slots
            .iter()
            .find(|slot| slot.index == index)
            .map(|slot| &slot.partition)
    }

    /// The tracked partitions in stable index order.
    pub fn partitions(&self) -> impl Iterator<Item = &P> {
        self.slots.iter().map(|slot| &slot.partition)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn top_shards(&self) -> usize {
        self.top_shards
    }

    /// If every key maps to all tracked partitions.
    pub fn is_predefined(&self) -> bool {
        self.predefined.is_some()
    }
}

impl<P> RendezvousHashSharder<P>
where
    P: PartialEq + Debug,
{
    /// The stable index of a tracked partition.
    pub fn index_of(&self, partition: &P) -> Result<usize, ClusterError> {
        self.slots
            .iter()
            .find(|slot| &slot.partition == partition)
            .map(|slot| slot.index)
            .ok_or_else(|| ClusterError::NotFound(format!("Cannot find partition: {:?}", partition)))
    }
}

#[derive(Clone)]
/// A fixed size set of bucket numbers.
pub struct BucketSet {
    words: [u64; NUMBER_OF_BUCKETS / 64],
}

impl Default for BucketSet {
    fn default() -> Self {
        Self {
            words: [0; NUMBER_OF_BUCKETS / 64],
        }
    }
}

impl BucketSet {
    #[inline]
    pub fn insert(&mut self, bucket: usize) {
        self.words[bucket / 64] |= 1 << (bucket % 64);
    }

    #[inline]
    pub fn contains(&self, bucket: usize) -> bool {
        self.words[bucket / 64] & (1 << (bucket % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUMBER_OF_BUCKETS).filter(|bucket| self.contains(*bucket))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("partition-{}", i)).collect()
    }

    fn sharder(n: usize, top: usize) -> RendezvousHashSharder<String> {
        RendezvousHashSharder::create(names(n), top, |p| crate::hash32(p))
    }

    #[test]
    fn test_stable_indices() {
        let sharder = RendezvousHashSharder::create(
            vec!["c".to_string(), "a".to_string(), "b".to_string(), "a".to_string()],
            1,
            |p| crate::hash32(p),
        );

        assert_eq!(sharder.len(), 3, "Duplicates should be removed.");
        assert_eq!(sharder.index_of(&"a".to_string()).unwrap(), 0);
        assert_eq!(sharder.index_of(&"b".to_string()).unwrap(), 1);
        assert_eq!(sharder.index_of(&"c".to_string()).unwrap(), 2);
        assert!(matches!(
            sharder.index_of(&"d".to_string()),
            Err(ClusterError::NotFound(_))
        ));
    }

    #[test]
    fn test_shard_returns_distinct_partitions() {
        let sharder = sharder(10, 3);
        assert!(!sharder.is_predefined());

        for key in 0..1_000u64 {
            let shard = sharder.shard(&key);
            assert_eq!(shard.len(), 3);
            let unique = shard.iter().collect::<BTreeSet<_>>();
            assert_eq!(unique.len(), 3, "Replica sets should not repeat partitions.");
        }
    }

    #[test]
    fn test_uniform_distribution() {
        let num_partitions = 5;
        let top = 3;
        let num_keys = 100_000u64;
        let sharder = sharder(num_partitions, top);

        let mut counts = BTreeMap::<usize, u64>::new();
        for key in 0..num_keys {
            for index in sharder.shard(&key) {
                *counts.entry(*index).or_default() += 1;
            }
        }

        let expected = (num_keys * top as u64) / num_partitions as u64;
        for (index, count) in counts {
            let deviation = (count as f64 - expected as f64).abs() / expected as f64;
            assert!(
                deviation < 0.15,
                "Partition {} received {} keys, expected around {}",
                index,
                count,
                expected,
            );
        }
    }

    #[test]
    fn test_removal_only_moves_affected_keys() {
        let mut sharder = sharder(10, 3);

        let before = (0..10_000u64)
            .map(|key| sharder.shard(&key).to_vec())
            .collect::<Vec<_>>();

        let removed = "partition-4".to_string();
        let removed_index = sharder.index_of(&removed).unwrap();
        let alive = names(10)
            .into_iter()
            .filter(|name| name != &removed)
            .collect::<BTreeSet<_>>();
        assert!(sharder.recompute(&alive));
        assert!(!sharder.recompute(&alive), "Unchanged membership is a no-op.");

        assert_eq!(
            sharder.index_of(&"partition-9".to_string()).unwrap(),
            9,
            "Surviving partitions keep their index."
        );

        let mut moved = 0;
        for (key, previous) in before.iter().enumerate() {
            let current = sharder.shard(&(key as u64));
            assert!(!current.contains(&removed_index));

            if previous.contains(&removed_index) {
                moved += 1;
                let kept = previous
                    .iter()
                    .filter(|index| **index != removed_index)
                    .collect::<Vec<_>>();
                for index in kept {
                    assert!(
                        current.contains(index),
                        "Surviving replicas of key {} should be kept",
                        key
                    );
                }
            } else {
                assert_eq!(current, previous.as_slice(), "Key {} should not move", key);
            }
        }
        assert!(moved > 0);
    }

    #[test]
    fn test_predefined_mode() {
        let mut sharder = sharder(3, 3);
        assert!(sharder.is_predefined());

        for key in 0..1_000u64 {
            assert_eq!(sharder.shard(&key), &[0, 1, 2]);
        }

        let alive = ["partition-0", "partition-2"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>();
        assert!(sharder.recompute(&alive));
        for key in 0..1_000u64 {
            assert_eq!(sharder.shard(&key), &[0, 2]);
        }
    }

    #[test]
    fn test_shrinking_into_predefined_mode() {
        let mut sharder = sharder(4, 3);
        assert!(!sharder.is_predefined());

        let alive = names(3).into_iter().collect::<BTreeSet<_>>();
        sharder.recompute(&alive);
        assert!(sharder.is_predefined());
        assert_eq!(sharder.shard(&"anything"), &[0, 1, 2]);
    }

    #[test]
    fn test_combined_hash_mixes_buckets() {
        let ranks = (0..NUMBER_OF_BUCKETS as u32)
            .map(|bucket| combined_hash(1, bucket) > combined_hash(2, bucket))
            .filter(|first_wins| *first_wins)
            .count();
        let share = ranks as f64 / NUMBER_OF_BUCKETS as f64;
        assert!(
            (0.4..0.6).contains(&share),
            "Ranking of two partitions should be a coin flip per bucket, got {}",
            share
        );
    }

    #[test]
    fn test_bucket_set() {
        let mut set = BucketSet::default();
        assert!(set.is_empty());

        set.insert(0);
        set.insert(63);
        set.insert(64);
        set.insert(NUMBER_OF_BUCKETS - 1);
        assert!(set.contains(63));
        assert!(!set.contains(62));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            [0, 63, 64, NUMBER_OF_BUCKETS - 1],
        );
    }
}
