use std::cmp;

#[cfg(feature = "rkyv-support")]
use rkyv::{Archive, Deserialize, Serialize};

use crate::CrdtFunction;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "rkyv-support", derive(Serialize, Deserialize, Archive))]
#[cfg_attr(feature = "rkyv-support", archive(check_bytes))]
/// A single key of a CRDT storage along with its state.
pub struct CrdtData<K, S> {
    /// The key of the entry.
    pub key: K,
    /// The unix timestamp (ms) of the last modification of this entry.
    pub timestamp: u64,
    /// The CRDT state itself.
    pub state: S,
}

impl<K, S> CrdtData<K, S> {
    pub fn new(key: K, timestamp: u64, state: S) -> Self {
        Self {
            key,
            timestamp,
            state,
        }
    }

    /// Merges another copy of the same key into this entry.
    ///
    /// The key of `self` is kept, callers are expected to only merge
    /// entries which share a key.
    pub fn merge_with<F>(self, other: Self, function: &F) -> Self
    where
        F: CrdtFunction<S> + ?Sized,
    {
        Self {
            key: self.key,
            timestamp: cmp::max(self.timestamp, other.timestamp),
            state: function.merge(self.state, other.state),
        }
    }

    /// Applies the function's extraction to the entry, returning `None`
    /// if the entry holds nothing at or after `timestamp`.
    pub fn extract<F>(self, timestamp: u64, function: &F) -> Option<Self>
    where
        F: CrdtFunction<S> + ?Sized,
    {
        if self.timestamp < timestamp {
            return None;
        }

        let state = function.extract(self.state, timestamp)?;
        Some(Self {
            key: self.key,
            timestamp: self.timestamp,
            state,
        })
    }
}
