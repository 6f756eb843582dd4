//! # Crdtcake RPC
//!
//! A framed, session oriented transport over TCP.
//!
//! Messages are [rkyv] archives tagged with a stable [MessageKind] and validated
//! on receipt. A [Server] dispatches the first message of every session to the
//! [Handler] registered for its kind, the handler is then free to stream any number
//! of follow-up messages over the same [Channel].
//!
//! ```rust
//! use crdtcake_rpc::{async_trait, Channel, Handler, RpcMessage, RpcService, Server, ServiceRegistry, Status};
//! use rkyv::{Archive, Deserialize, Serialize};
//!
//! #[repr(C)]
//! #[derive(Serialize, Deserialize, Archive, Debug)]
//! #[archive(check_bytes)]
//! pub struct Add(u64, u64);
//!
//! impl RpcMessage for Add {
//!     const KIND: u16 = 1;
//! }
//!
//! #[repr(C)]
//! #[derive(Serialize, Deserialize, Archive, Debug)]
//! #[archive(check_bytes)]
//! pub struct Sum(u64);
//!
//! impl RpcMessage for Sum {
//!     const KIND: u16 = 2;
//! }
//!
//! pub struct Adder;
//!
//! impl RpcService for Adder {
//!     fn register_handlers(registry: &mut ServiceRegistry<Self>) {
//!         registry.add_handler::<Add>();
//!     }
//! }
//!
//! #[async_trait]
//! impl Handler<Add> for Adder {
//!     async fn on_message(&self, msg: Add, channel: &mut Channel) -> Result<(), Status> {
//!         channel.send(&Sum(msg.0 + msg.1)).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::builder()
//!         .add_service(Adder)
//!         .listen("127.0.0.1:0".parse()?)
//!         .await?;
//!
//!     let mut channel = Channel::connect(server.local_addr()).await?;
//!     channel.send(&Add(3, 4)).await?;
//!     let sum = channel.recv::<Sum>().await?;
//!     assert_eq!(sum.0, 7);
//!
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod handler;
mod net;
mod server;

pub const SCRATCH_SPACE: usize = 4096;

pub use async_trait::async_trait;
pub use handler::{Handler, RpcMessage, RpcService, ServiceRegistry};
pub use net::{
    decode,
    ArchivedErrorCode,
    ArchivedStatus,
    Channel,
    ErrorCode,
    Frame,
    MessageKind,
    Status,
};
pub use server::{Server, ServerBuilder};
