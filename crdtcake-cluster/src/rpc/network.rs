use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crdtcake_crdt::CrdtCodec;
use crdtcake_storage::CrdtStorage;
use parking_lot::RwLock;

use super::client::{RemoteCrdtStorage, RemoteOptions};
use crate::scheme::StorageProvider;
use crate::PartitionId;

/// Provides [RemoteCrdtStorage] clients for partitions by their storage address.
///
/// Clients are created lazily and shared between every partition using the
/// same address. Wrap the network in an `Arc` to share it between schemes.
pub struct RemoteNetwork<K, S> {
    codec: Arc<dyn CrdtCodec<K, S>>,
    options: RemoteOptions,
    clients: RwLock<BTreeMap<SocketAddr, Arc<RemoteCrdtStorage<K, S>>>>,
}

impl<K, S> RemoteNetwork<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub fn new(codec: impl CrdtCodec<K, S>, options: RemoteOptions) -> Self {
        Self {
            codec: Arc::new(codec),
            options,
            clients: RwLock::new(BTreeMap::new()),
        }
    }

    /// Gets or creates the client for the given address.
    pub fn get_or_connect(&self, addr: SocketAddr) -> Arc<RemoteCrdtStorage<K, S>> {
        {
            let guard = self.clients.read();
            if let Some(client) = guard.get(&addr) {
                return client.clone();
            }
        }

        let mut guard = self.clients.write();
        guard
            .entry(addr)
            .or_insert_with(|| {
                debug!(addr = %addr, "Creating storage client.");
                Arc::new(RemoteCrdtStorage::new(
                    addr,
                    self.codec.clone(),
                    self.options.clone(),
                ))
            })
            .clone()
    }

    /// Removes the client for the given address.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.clients.write().remove(&addr);
    }
}

impl<K, S> StorageProvider<K, S> for RemoteNetwork<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn get_storage(&self, partition: &PartitionId) -> Option<Arc<dyn CrdtStorage<K, S>>> {
        let addr = partition.storage_addr()?;
        let client: Arc<dyn CrdtStorage<K, S>> = self.get_or_connect(addr);
        Some(client)
    }
}
