use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::handler::{OpaqueMessageHandler, RpcService, ServiceRegistry};
use crate::net::{Channel, Frame, MessageKind};
use crate::Status;

type Handlers = BTreeMap<MessageKind, Arc<dyn OpaqueMessageHandler>>;

#[derive(Default)]
/// Assembles the dispatch table of a [Server].
///
/// The table is frozen once the server starts listening.
pub struct ServerBuilder {
    handlers: Handlers,
}

impl ServerBuilder {
    /// Adds a service and every handler it registers.
    ///
    /// # Panics
    /// If the service registers a message kind already handled by
    /// a previously added service.
    pub fn add_service<Svc>(mut self, service: Svc) -> Self
    where
        Svc: RpcService,
    {
        let mut registry = ServiceRegistry::new(service);
        Svc::register_handlers(&mut registry);

        for (kind, handler) in registry.into_handlers() {
            let previous = self.handlers.insert(kind, handler);
            assert!(
                previous.is_none(),
                "A handler for message kind {} is already registered",
                kind,
            );
        }

        self
    }

    /// Binds to the address and spawns the server task.
    pub async fn listen(self, addr: SocketAddr) -> io::Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let state = ServerState {
            handlers: Arc::new(self.handlers),
            connections: Default::default(),
            next_connection_id: Default::default(),
        };

        let handle = tokio::spawn(accept_connections(listener, state.clone()));

        info!(listen_addr = %local_addr, "RPC server is running.");

        Ok(Server {
            local_addr,
            state,
            handle,
        })
    }
}

/// A RPC server instance.
///
/// Dropping the server shuts it down.
pub struct Server {
    local_addr: SocketAddr,
    state: ServerState,
    handle: JoinHandle<()>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    #[inline]
    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The number of currently open connections.
    pub fn num_connections(&self) -> usize {
        let mut connections = self.state.connections.lock();
        connections.retain(|_, handle| !handle.is_finished());
        connections.len()
    }

    /// Stops accepting connections and aborts every open connection.
    pub fn shutdown(&self) {
        let num_connections = self.abort_all();
        info!(
            listen_addr = %self.local_addr,
            num_connections = num_connections,
            "RPC server has shut down.",
        );
    }

    fn abort_all(&self) -> usize {
        self.handle.abort();

        let connections = std::mem::take(&mut *self.state.connections.lock());
        for handle in connections.values() {
            handle.abort();
        }
        connections.len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[derive(Clone)]
/// Represents the shared state of the RPC server.
struct ServerState {
    handlers: Arc<Handlers>,
    connections: Arc<Mutex<BTreeMap<u64, JoinHandle<()>>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl ServerState {
    fn track(&self, connection_id: u64, handle: JoinHandle<()>) {
        let mut connections = self.connections.lock();
        connections.retain(|_, handle| !handle.is_finished());
        connections.insert(connection_id, handle);
    }

    fn untrack(&self, connection_id: u64) {
        self.connections.lock().remove(&connection_id);
    }
}

async fn accept_connections(listener: TcpListener, state: ServerState) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = ?e, "Failed to accept connection.");
                continue;
            },
        };

        let channel = match Channel::from_stream(stream, remote_addr) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = ?e, remote_addr = %remote_addr, "Failed to setup connection.");
                continue;
            },
        };

        let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            handle_sessions(channel, &task_state.handlers).await;
            task_state.untrack(connection_id);
        });
        state.track(connection_id, handle);
    }
}

/// Dispatches every session opened on the connection until it is closed.
async fn handle_sessions(mut channel: Channel, handlers: &Handlers) {
    let remote_addr = channel.remote_addr();

    loop {
        let (kind, payload) = match channel.recv_frame().await {
            Ok(Some(Frame::Message { kind, payload })) => (kind, payload),
            Ok(Some(Frame::Error(status))) => {
                debug!(remote_addr = %remote_addr, status = %status, "Peer aborted between sessions.");
                continue;
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = ?e, remote_addr = %remote_addr, "Connection failed.");
                break;
            },
        };

        let result = match handlers.get(&kind) {
            Some(handler) => handler.try_handle(payload, &mut channel).await,
            None => Err(Status::unknown_kind(kind)),
        };

        if let Err(status) = result {
            if status.is_connection_error() {
                debug!(remote_addr = %remote_addr, status = %status, "Session ended by connection failure.");
                break;
            }

            if let Err(e) = channel.send_error(&status).await {
                warn!(error = ?e, "Encountered an IO error while handling connection.");
                break;
            }
        }
    }
}
