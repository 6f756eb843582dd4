use std::io;

use crdtcake_crdt::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
/// The errors a partition storage can produce.
pub enum StorageError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Codec(#[from] CodecError),

    #[error("Storage data is corrupted: {0}")]
    /// Persisted data failed a checksum or could not be decoded.
    Corrupted(String),

    #[error("Operation was aborted: {0}")]
    /// The producer of a stream gave up before completing it.
    Aborted(String),

    #[error("Storage is unavailable: {0}")]
    /// The storage could not be reached at all.
    Unavailable(String),

    #[error("Remote storage returned an error: {0}")]
    /// The storage was reached but responded with an error.
    Remote(String),
}
