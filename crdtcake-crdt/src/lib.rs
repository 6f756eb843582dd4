//! # Crdtcake CRDT
//!
//! The value-level contract every crdtcake storage layer builds upon.
//!
//! A [CrdtFunction] is the domain supplied combine operator of a CRDT, it must be
//! commutative, associative and idempotent so that replicas holding different copies
//! of the same key converge no matter which order their states are merged in.
//! Entries travel through the system as [CrdtData], a key paired with its last-modified
//! timestamp and the CRDT state itself.
//!
//! ### Basic Example
//! ```rust
//! use std::collections::BTreeSet;
//! use crdtcake_crdt::{CrdtData, TimestampContainer};
//!
//! let union = TimestampContainer::crdt_function(|mut a: BTreeSet<u32>, b: BTreeSet<u32>| {
//!     a.extend(b);
//!     a
//! });
//!
//! // Two replicas observed different writes for the same key.
//! let replica_a = CrdtData::new("key", 1, TimestampContainer::new(1, BTreeSet::from([1, 2, 3])));
//! let replica_b = CrdtData::new("key", 2, TimestampContainer::new(2, BTreeSet::from([2, 3, 7])));
//!
//! // Merging in either order produces the same state.
//! let left = replica_a.clone().merge_with(replica_b.clone(), &union);
//! let right = replica_b.merge_with(replica_a, &union);
//! assert_eq!(left, right);
//! assert_eq!(left.state.state(), &BTreeSet::from([1, 2, 3, 7]));
//! ```

mod codec;
mod data;
mod function;
mod timestamp;

#[cfg(feature = "rkyv-support")]
pub use codec::RkyvCodec;
pub use codec::{CodecError, CrdtCodec};
pub use data::CrdtData;
pub use function::{ignoring_timestamp, CrdtFunction, IgnoringTimestamp};
pub use timestamp::{get_unix_timestamp_ms, TimestampContainer, TimestampFunction};

/// The scratch space used when serializing entries with rkyv.
pub const SCRATCH_SPACE: usize = 1024;
