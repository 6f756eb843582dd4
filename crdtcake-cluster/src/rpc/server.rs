use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crdtcake_crdt::{CrdtCodec, CrdtData};
use crdtcake_rpc::{
    async_trait,
    Channel,
    Frame,
    Handler,
    RpcMessage,
    RpcService,
    Server,
    ServiceRegistry,
    Status,
};
use crdtcake_storage::{CrdtStorage, CrdtStream, StorageError};
use futures::StreamExt;

use super::messages::{Ack, Download, EndOfStream, EntryBatch, Ping, TakeSnapshot, Upload};
use super::{to_status, DEFAULT_BATCH_SIZE};

/// Serves a partition's storage to [super::RemoteCrdtStorage] clients.
pub struct CrdtServer {
    server: Server,
}

impl CrdtServer {
    /// Starts serving the storage on the given address.
    pub async fn listen<K, S>(
        addr: SocketAddr,
        storage: Arc<dyn CrdtStorage<K, S>>,
        codec: Arc<dyn CrdtCodec<K, S>>,
    ) -> io::Result<Self>
    where
        K: Send + Sync + 'static,
        S: Send + Sync + 'static,
    {
        let service = CrdtService { storage, codec };
        let server = Server::builder().add_service(service).listen(addr).await?;
        info!(listen_addr = %server.local_addr(), "Partition storage is being served.");
        Ok(Self { server })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stops the server, aborting every in-flight session.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

struct CrdtService<K, S> {
    storage: Arc<dyn CrdtStorage<K, S>>,
    codec: Arc<dyn CrdtCodec<K, S>>,
}

impl<K, S> RpcService for CrdtService<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn register_handlers(registry: &mut ServiceRegistry<Self>) {
        registry.add_handler::<Upload>();
        registry.add_handler::<Download>();
        registry.add_handler::<TakeSnapshot>();
        registry.add_handler::<Ping>();
    }
}

enum Forwarded {
    /// The client sent every batch.
    Complete,
    /// The storage stopped consuming entries.
    Rejected,
}

impl<K, S> CrdtService<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// Forwards the client's entries to the storage's upload stream.
    ///
    /// Anything other than a clean end of stream is forwarded as an error,
    /// causing the storage to discard the upload.
    async fn forward_batches(
        &self,
        channel: &mut Channel,
        tx: flume::Sender<Result<CrdtData<K, S>, StorageError>>,
    ) -> Result<Forwarded, Status> {
        loop {
            let (kind, payload) = match channel.recv_frame().await {
                Ok(Some(Frame::Message { kind, payload })) => (kind, payload),
                Ok(Some(Frame::Error(status))) => {
                    let _ = tx
                        .send_async(Err(StorageError::Aborted(status.message.clone())))
                        .await;
                    return Err(Status::connection(status));
                },
                Ok(None) => {
                    let _ = tx
                        .send_async(Err(StorageError::Aborted(
                            "The client disconnected".to_string(),
                        )))
                        .await;
                    return Err(Status::closed());
                },
                Err(e) => {
                    let _ = tx
                        .send_async(Err(StorageError::Aborted(e.to_string())))
                        .await;
                    return Err(Status::connection(e));
                },
            };

            if kind == EndOfStream::KIND {
                return Ok(Forwarded::Complete);
            }

            if kind != EntryBatch::KIND {
                let _ = tx
                    .send_async(Err(StorageError::Aborted(format!(
                        "Unexpected message kind {}",
                        kind
                    ))))
                    .await;
                return Err(Status::unexpected(kind));
            }

            let batch = match crdtcake_rpc::decode::<EntryBatch>(&payload) {
                Ok(batch) => batch,
                Err(status) => {
                    let _ = tx
                        .send_async(Err(StorageError::Aborted(status.message.clone())))
                        .await;
                    return Err(status);
                },
            };
            for bytes in batch.entries {
                let entry = self.codec.decode(&bytes).map_err(StorageError::from);
                if tx.send_async(entry).await.is_err() {
                    return Ok(Forwarded::Rejected);
                }
            }
        }
    }

    /// Sends the entries to the client in batches followed by [EndOfStream].
    async fn send_batches(
        &self,
        channel: &mut Channel,
        mut entries: CrdtStream<K, S>,
    ) -> Result<(), Status> {
        let mut batch = Vec::with_capacity(DEFAULT_BATCH_SIZE);
        while let Some(entry) = entries.next().await {
            let entry = entry.map_err(to_status)?;
            let bytes = self
                .codec
                .encode(&entry)
                .map_err(Status::internal)?;
            batch.push(bytes);

            if batch.len() >= DEFAULT_BATCH_SIZE {
                let entries =
                    std::mem::replace(&mut batch, Vec::with_capacity(DEFAULT_BATCH_SIZE));
                channel.send(&EntryBatch { entries }).await?;
            }
        }

        if !batch.is_empty() {
            channel.send(&EntryBatch { entries: batch }).await?;
        }

        channel.send(&EndOfStream).await
    }
}

#[async_trait]
impl<K, S> Handler<Upload> for CrdtService<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn on_message(&self, _msg: Upload, channel: &mut Channel) -> Result<(), Status> {
        let (tx, rx) = flume::bounded(DEFAULT_BATCH_SIZE);
        let entries = rx.into_stream().boxed();

        let (stored, forwarded) =
            futures::join!(self.storage.upload(entries), self.forward_batches(channel, tx));

        match (stored, forwarded) {
            (Ok(()), Ok(Forwarded::Complete)) => channel.send(&Ack).await,
            (Err(e), Ok(Forwarded::Complete)) => {
                warn!(error = %e, "Storage rejected upload.");
                Err(to_status(e))
            },
            (Err(e), Ok(Forwarded::Rejected)) => {
                warn!(error = %e, "Storage rejected upload part way through.");
                // The client is still streaming, the connection cannot be reused.
                let _ = channel.send_error(&to_status(e)).await;
                Err(Status::connection("Upload rejected"))
            },
            (Ok(()), Ok(Forwarded::Rejected)) => {
                Err(Status::connection("Storage stopped reading the upload"))
            },
            (_, Err(status)) => {
                debug!(status = %status, "Upload aborted by the client.");
                Err(status)
            },
        }
    }
}

#[async_trait]
impl<K, S> Handler<Download> for CrdtService<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn on_message(&self, msg: Download, channel: &mut Channel) -> Result<(), Status> {
        let entries = self
            .storage
            .download(msg.timestamp)
            .await
            .map_err(to_status)?;
        self.send_batches(channel, entries).await
    }
}

#[async_trait]
impl<K, S> Handler<TakeSnapshot> for CrdtService<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn on_message(
        &self,
        _msg: TakeSnapshot,
        channel: &mut Channel,
    ) -> Result<(), Status> {
        let take = self.storage.take().await.map_err(to_status)?;
        let (entries, commit) = take.into_parts();
        self.send_batches(channel, entries).await?;

        // Without an ack from the client the take is left uncommitted.
        channel.recv::<Ack>().await?;
        commit.commit().await.map_err(to_status)?;
        channel.send(&Ack).await
    }
}

#[async_trait]
impl<K, S> Handler<Ping> for CrdtService<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn on_message(&self, _msg: Ping, channel: &mut Channel) -> Result<(), Status> {
        self.storage.ping().await.map_err(to_status)?;
        channel.send(&Ack).await
    }
}
