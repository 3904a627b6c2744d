// Push transport seam used by the connection manager.
//
// A `PushTransport` opens connections; a `PushConnection` carries topic
// subscriptions and yields inbound events until the peer goes away. Two
// implementations live here: WebSocket (Pusher-compatible) and in-process
// (backed by `chime-broker`).
use async_trait::async_trait;
use bytes::Bytes;
use chime_broker::BrokerError;
use chime_common::{Topic, UserId};
use std::time::Duration;

pub mod inprocess;
pub mod ws;

pub use inprocess::InProcessTransport;
pub use ws::{WsConfig, WsTransport};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no traffic for {0:?}, connection considered dead")]
    Timeout(Duration),
    #[error("server error {code:?}: {message}")]
    Protocol { code: Option<u16>, message: String },
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Wire(#[from] chime_wire::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// A named event delivered on a topic. The payload is opaque to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub topic: String,
    pub event: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Event(PushEvent),
    // The server refused a subscription; the connection itself stays usable.
    SubscriptionFailed { topic: String, reason: String },
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, user: &UserId) -> Result<Box<dyn PushConnection>>;
}

#[async_trait]
pub trait PushConnection: Send {
    async fn subscribe(&mut self, topic: &Topic) -> Result<()>;

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<()>;

    /// Next inbound item. `Ok(None)` means the peer closed the connection.
    ///
    /// Must be cancel safe: callers race it against commands and shutdown.
    async fn next_inbound(&mut self) -> Result<Option<Inbound>>;

    async fn close(&mut self);
}
