use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::scheme::PartitionScheme;

/// Publishes the current [PartitionScheme] of the cluster.
///
/// The stream yields the current scheme immediately and a new scheme every
/// time the membership of the cluster changes.
pub trait DiscoveryService<K, S>: Send + Sync + 'static
where
    K: 'static,
    S: 'static,
{
    fn discover(&self) -> WatchStream<Arc<PartitionScheme<K, S>>>;
}

/// A discovery service with a scheme that never changes.
pub struct StaticDiscovery<K, S> {
    rx: watch::Receiver<Arc<PartitionScheme<K, S>>>,
    // Keeps the channel open for the lifetime of the service.
    _tx: watch::Sender<Arc<PartitionScheme<K, S>>>,
}

impl<K, S> StaticDiscovery<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub fn new(scheme: PartitionScheme<K, S>) -> Self {
        let (tx, rx) = watch::channel(Arc::new(scheme));
        Self { rx, _tx: tx }
    }
}

impl<K, S> DiscoveryService<K, S> for StaticDiscovery<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn discover(&self) -> WatchStream<Arc<PartitionScheme<K, S>>> {
        WatchStream::new(self.rx.clone())
    }
}

/// A discovery service fed by an external membership source.
///
/// Every call to [DynamicDiscovery::publish] replaces the scheme seen by
/// all watchers. Clones share the same channel.
pub struct DynamicDiscovery<K, S> {
    tx: Arc<watch::Sender<Arc<PartitionScheme<K, S>>>>,
    rx: watch::Receiver<Arc<PartitionScheme<K, S>>>,
}

impl<K, S> Clone for DynamicDiscovery<K, S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<K, S> DynamicDiscovery<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub fn new(initial: PartitionScheme<K, S>) -> Self {
        let (tx, rx) = watch::channel(Arc::new(initial));
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Publishes a new scheme to every watcher.
    pub fn publish(&self, scheme: PartitionScheme<K, S>) {
        self.tx.send_replace(Arc::new(scheme));
    }

    /// The most recently published scheme.
    pub fn current(&self) -> Arc<PartitionScheme<K, S>> {
        self.rx.borrow().clone()
    }
}

impl<K, S> DiscoveryService<K, S> for DynamicDiscovery<K, S>
where
    K: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn discover(&self) -> WatchStream<Arc<PartitionScheme<K, S>>> {
        WatchStream::new(self.rx.clone())
    }
}
