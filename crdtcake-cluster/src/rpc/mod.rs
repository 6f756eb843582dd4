//! The partition protocol, serving a [crdtcake_storage::CrdtStorage] over the network.
//!
//! Every request opens a session on a fresh connection:
//!
//! - `Upload`: the client streams `EntryBatch` messages followed by `EndOfStream`
//!   and waits for an `Ack` once the storage applied the upload.
//! - `Download`: the server streams `EntryBatch` messages followed by `EndOfStream`.
//! - `TakeSnapshot`: as download, the client then sends `Ack` to commit the take
//!   and waits for the server's `Ack`.
//! - `Ping`: answered with `Ack`.
//!
//! Any failure is reported as an error frame, aborting the session.

mod client;
mod messages;
mod network;
mod server;

use crdtcake_rpc::Status;
use crdtcake_storage::StorageError;

pub use client::{RemoteCrdtStorage, RemoteOptions};
pub use messages::{Ack, Download, EndOfStream, EntryBatch, Ping, TakeSnapshot, Upload};
pub use network::RemoteNetwork;
pub use server::CrdtServer;

/// The number of entries sent in a single batch by default.
pub const DEFAULT_BATCH_SIZE: usize = 256;

pub(crate) fn from_status(status: Status) -> StorageError {
    if status.is_connection_error() {
        StorageError::Unavailable(status.to_string())
    } else {
        StorageError::Remote(status.message)
    }
}

pub(crate) fn to_status(error: StorageError) -> Status {
    match error {
        StorageError::Unavailable(msg) => Status::unavailable(msg),
        other => Status::internal(other),
    }
}
