//! # Crdtcake
//! Partitioned and replicated storage of CRDT entries.
//!
//! This is a convenience package which includes all of the sub-projects within
//! crdtcake, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `crdtcake_cluster` - Routes entries to partitions and reconciles their replicas on read.
//! - `crdtcake_storage` - The per-partition storage contract with in-memory and file backed engines.
//! - `crdtcake_crdt` - CRDT merge functions, timestamped entries and entry codecs.
//! - `crdtcake_rpc` - A small framed TCP transport used to reach remote partitions.

#[cfg(feature = "crdtcake-cluster")]
pub use crdtcake_cluster as cluster;
#[cfg(feature = "crdtcake-crdt")]
pub use crdtcake_crdt as crdt;
#[cfg(feature = "crdtcake-rpc")]
pub use crdtcake_rpc as rpc;
#[cfg(feature = "crdtcake-storage")]
pub use crdtcake_storage as storage;
