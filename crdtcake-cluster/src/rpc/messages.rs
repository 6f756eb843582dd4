use crdtcake_rpc::{MessageKind, RpcMessage};
use rkyv::{Archive, Deserialize, Serialize};

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
#[archive(check_bytes)]
/// Opens an upload session.
pub struct Upload;

impl RpcMessage for Upload {
    const KIND: MessageKind = 1;
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
#[archive(check_bytes)]
/// Opens a download session of every entry modified at or after `timestamp`.
pub struct Download {
    pub timestamp: u64,
}

impl RpcMessage for Download {
    const KIND: MessageKind = 2;
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
#[archive(check_bytes)]
/// Opens a take session.
pub struct TakeSnapshot;

impl RpcMessage for TakeSnapshot {
    const KIND: MessageKind = 3;
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
#[archive(check_bytes)]
pub struct Ping;

impl RpcMessage for Ping {
    const KIND: MessageKind = 4;
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
#[archive(check_bytes)]
/// A batch of encoded entries.
pub struct EntryBatch {
    pub entries: Vec<Vec<u8>>,
}

impl RpcMessage for EntryBatch {
    const KIND: MessageKind = 10;
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
#[archive(check_bytes)]
/// Marks the end of a stream of entry batches.
pub struct EndOfStream;

impl RpcMessage for EndOfStream {
    const KIND: MessageKind = 11;
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
#[archive(check_bytes)]
pub struct Ack;

impl RpcMessage for Ack {
    const KIND: MessageKind = 12;
}
