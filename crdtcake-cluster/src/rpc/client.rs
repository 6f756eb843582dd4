use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crdtcake_crdt::CrdtCodec;
use crdtcake_crdt::CrdtData;
use crdtcake_rpc::{Channel, Frame, RpcMessage, Status};
use crdtcake_storage::{CrdtStorage, CrdtStream, StorageError, Take, TakeCommit};
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use super::messages::{Ack, Download, EndOfStream, EntryBatch, Ping, TakeSnapshot, Upload};
use super::{from_status, DEFAULT_BATCH_SIZE};

#[derive(Debug, Clone)]
/// Tuning of a [RemoteCrdtStorage].
pub struct RemoteOptions {
    /// How long to wait for a connection to the partition.
    pub connect_timeout: Duration,
    /// The number of entries sent per batch when uploading.
    pub batch_size: usize,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RemoteOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// The storage of a partition served by a [super::CrdtServer].
///
/// A new connection is opened for every request.
pub struct RemoteCrdtStorage<K, S> {
    addr: SocketAddr,
    codec: Arc<dyn CrdtCodec<K, S>>,
    options: RemoteOptions,
}

impl<K, S> RemoteCrdtStorage<K, S>
where
    K: Send + 'static,
    S: Send + 'static,
{
    pub fn new(
        addr: SocketAddr,
        codec: Arc<dyn CrdtCodec<K, S>>,
        options: RemoteOptions,
    ) -> Self {
        Self {
            addr,
            codec,
            options,
        }
    }

    #[inline]
    /// The address of the remote storage.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> Result<Channel, StorageError> {
        Channel::connect_timeout(self.addr, self.options.connect_timeout)
            .await
            .map_err(|e| {
                StorageError::Unavailable(format!("Failed to connect to {}: {}", self.addr, e))
            })
    }

    /// Converts a session into the stream of entries the server sends back.
    fn entry_stream(
        &self,
        channel: Channel,
        on_end: Option<Arc<Mutex<Option<Channel>>>>,
    ) -> CrdtStream<K, S> {
        let state = EntryStreamState {
            channel: Some(channel),
            pending: VecDeque::new(),
            codec: self.codec.clone(),
            on_end,
        };

        stream::unfold(state, |mut state| async move {
            let item = state.next_entry().await?;
            Some((item, state))
        })
        .boxed()
    }
}

struct EntryStreamState<K, S> {
    channel: Option<Channel>,
    pending: VecDeque<Vec<u8>>,
    codec: Arc<dyn CrdtCodec<K, S>>,
    /// Receives the channel once the stream completed.
    on_end: Option<Arc<Mutex<Option<Channel>>>>,
}

impl<K, S> EntryStreamState<K, S>
where
    K: 'static,
    S: 'static,
{
    async fn next_entry(
        &mut self,
    ) -> Option<Result<CrdtData<K, S>, StorageError>> {
        loop {
            if let Some(bytes) = self.pending.pop_front() {
                return Some(self.codec.decode(&bytes).map_err(StorageError::from));
            }

            let channel = self.channel.as_mut()?;
            let frame = match channel.recv_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return self.fail(Status::closed()),
                Err(e) => return self.fail(Status::connection(e)),
            };

            match frame {
                Frame::Message { kind, payload } if kind == EntryBatch::KIND => {
                    match crdtcake_rpc::decode::<EntryBatch>(&payload) {
                        Ok(batch) => self.pending.extend(batch.entries),
                        Err(status) => return self.fail(status),
                    }
                },
                Frame::Message { kind, .. } if kind == EndOfStream::KIND => {
                    let channel = self.channel.take();
                    if let Some(slot) = self.on_end.take() {
                        *slot.lock() = channel;
                    }
                    return None;
                },
                Frame::Message { kind, .. } => return self.fail(Status::unexpected(kind)),
                Frame::Error(status) => return self.fail(status),
            }
        }
    }

    fn fail<T>(&mut self, status: Status) -> Option<Result<T, StorageError>> {
        self.channel = None;
        self.pending.clear();
        Some(Err(from_status(status)))
    }
}

/// Commits a remote take over the session which read it.
struct RemoteTakeCommit {
    slot: Arc<Mutex<Option<Channel>>>,
}

#[async_trait]
impl TakeCommit for RemoteTakeCommit {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let channel = self.slot.lock().take();
        let mut channel = channel.ok_or_else(|| {
            StorageError::Aborted("The take must be fully read before committing".to_string())
        })?;

        channel.send(&Ack).await.map_err(from_status)?;
        channel.recv::<Ack>().await.map_err(from_status)?;
        let _ = channel.close().await;
        Ok(())
    }
}

#[async_trait]
impl<K, S> CrdtStorage<K, S> for RemoteCrdtStorage<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn upload(&self, mut entries: CrdtStream<K, S>) -> Result<(), StorageError> {
        let mut channel = self.connect().await?;
        channel.send(&Upload).await.map_err(from_status)?;

        let mut batch = Vec::with_capacity(self.options.batch_size);
        while let Some(entry) = entries.next().await {
            let encoded = entry.and_then(|entry| self.codec.encode(&entry).map_err(StorageError::from));

            let bytes = match encoded {
                Ok(bytes) => bytes,
                Err(e) => {
                    let status = Status::internal(format!("Upload aborted: {}", e));
                    let _ = channel.close_with_error(&status).await;
                    return Err(e);
                },
            };

            batch.push(bytes);
            if batch.len() >= self.options.batch_size {
                let entries = std::mem::replace(
                    &mut batch,
                    Vec::with_capacity(self.options.batch_size),
                );
                channel
                    .send(&EntryBatch { entries })
                    .await
                    .map_err(from_status)?;
            }
        }

        if !batch.is_empty() {
            channel
                .send(&EntryBatch { entries: batch })
                .await
                .map_err(from_status)?;
        }

        channel.send(&EndOfStream).await.map_err(from_status)?;
        channel.recv::<Ack>().await.map_err(from_status)?;
        let _ = channel.close().await;
        Ok(())
    }

    async fn download(&self, timestamp: u64) -> Result<CrdtStream<K, S>, StorageError> {
        let mut channel = self.connect().await?;
        channel
            .send(&Download { timestamp })
            .await
            .map_err(from_status)?;
        Ok(self.entry_stream(channel, None))
    }

    async fn take(&self) -> Result<Take<K, S>, StorageError> {
        let mut channel = self.connect().await?;
        channel.send(&TakeSnapshot).await.map_err(from_status)?;

        let slot = Arc::new(Mutex::new(None));
        let entries = self.entry_stream(channel, Some(slot.clone()));
        Ok(Take::new(entries, RemoteTakeCommit { slot }))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut channel = self.connect().await?;
        channel.send(&Ping).await.map_err(from_status)?;
        channel.recv::<Ack>().await.map_err(from_status)?;
        let _ = channel.close().await;
        Ok(())
    }
}
