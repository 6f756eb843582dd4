use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytecheck::CheckBytes;
use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, Deserialize};

use crate::net::{Channel, MessageKind, Status};

/// A message which can be sent across a [Channel].
pub trait RpcMessage: Archive + Send + Sync + 'static {
    /// The stable discriminant of the message on the wire.
    ///
    /// Kinds must be unique amongst the messages handled by a single server.
    const KIND: MessageKind;
}

/// A registry used for linking a service's message handlers with the
/// server at configuration time.
///
/// Not registering a handler will cause sessions opened with that message
/// to be rejected even if the service implements [Handler] for it.
pub struct ServiceRegistry<Svc> {
    handlers: BTreeMap<MessageKind, Arc<dyn OpaqueMessageHandler>>,
    service: Arc<Svc>,
}

impl<Svc> ServiceRegistry<Svc>
where
    Svc: RpcService,
{
    pub(crate) fn new(service: Svc) -> Self {
        Self {
            handlers: BTreeMap::new(),
            service: Arc::new(service),
        }
    }

    /// Consumes the registry into the produced handlers.
    pub(crate) fn into_handlers(self) -> BTreeMap<MessageKind, Arc<dyn OpaqueMessageHandler>> {
        self.handlers
    }

    /// Adds a new handler to the registry.
    ///
    /// This is done in the form of specifying what message types are handled
    /// by the service via the generic.
    ///
    /// # Panics
    /// If a handler for the message's kind is already registered.
    pub fn add_handler<Msg>(&mut self)
    where
        Msg: RpcMessage,
        Msg::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
            + Deserialize<Msg, SharedDeserializeMap>
            + 'static,
        Svc: Handler<Msg>,
    {
        let phantom = PhantomHandler {
            handler: self.service.clone(),
            _msg: PhantomData::<fn() -> Msg>,
        };

        let previous = self.handlers.insert(Msg::KIND, Arc::new(phantom));
        assert!(
            previous.is_none(),
            "A handler for message kind {} is already registered",
            Msg::KIND,
        );
    }
}

/// A service which handles sessions.
pub trait RpcService: Send + Sync + Sized + 'static {
    /// Register all message handlers for this service with the registry.
    ///
    /// See [ServiceRegistry] for more information.
    fn register_handlers(registry: &mut ServiceRegistry<Self>);
}

#[async_trait]
/// A handler for sessions opened with a `Msg`.
///
/// The handler owns the channel until it returns, anything it returns as
/// an error is sent to the peer as an error frame.
pub trait Handler<Msg>: RpcService
where
    Msg: RpcMessage,
{
    async fn on_message(&self, msg: Msg, channel: &mut Channel) -> Result<(), Status>;
}

#[async_trait]
pub(crate) trait OpaqueMessageHandler: Send + Sync {
    async fn try_handle(&self, payload: AlignedVec, channel: &mut Channel) -> Result<(), Status>;
}

struct PhantomHandler<H, Msg> {
    handler: Arc<H>,
    _msg: PhantomData<fn() -> Msg>,
}

#[async_trait]
impl<H, Msg> OpaqueMessageHandler for PhantomHandler<H, Msg>
where
    Msg: RpcMessage,
    Msg::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<Msg, SharedDeserializeMap>
        + 'static,
    H: Handler<Msg>,
{
    async fn try_handle(&self, payload: AlignedVec, channel: &mut Channel) -> Result<(), Status> {
        let msg = crate::decode::<Msg>(&payload)?;
        self.handler.on_message(msg, channel).await
    }
}
