//! # Crdtcake Storage
//!
//! The storage contract of a single crdtcake partition and the local engines
//! implementing it.
//!
//! Everything in a partition is expressed in terms of streams of [CrdtData] entries:
//! uploads consume a stream and apply it atomically, downloads and takes produce
//! a stream sorted by key. Keeping downloads sorted is what lets the cluster
//! merge many partitions without buffering them.
//!
//! [CrdtData]: crdtcake_crdt::CrdtData

#[macro_use]
extern crate tracing;

mod error;
mod fs;
mod map;
mod storage;

pub use error::StorageError;
pub use fs::FsCrdtStorage;
pub use map::MapCrdtStorage;
#[cfg(any(test, feature = "test-suite"))]
pub use storage::test_suite;
pub use storage::{CrdtStorage, CrdtStream, Take, TakeCommit};
