//! Abstract signaling socket contract (§4.B): a bidirectional event+ack
//! transport. A production implementation lives behind the `ws-signaling`
//! feature in [`super::native::signaling`]; a deterministic in-memory
//! implementation lives in [`super::testing`].

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("transport error: {0}")]
    Transport(String),
}

/// Query parameters sent on connect (§6.4).
#[derive(Debug, Clone)]
pub struct ConnectQuery {
    pub id: String,
    pub version: String,
    pub runtime: String,
    pub data: Option<serde_json::Value>,
}

/// Handler invoked for every inbound event of a given name. Registered via
/// [`SignalingSocket::on`].
pub type EventHandler = Box<dyn Fn(serde_json::Value) + Send + Sync>;

#[async_trait]
pub trait SignalingSocket: Send + Sync {
    /// Establish the transport-level connection using the given query
    /// parameters. Resolves once the underlying connection is open;
    /// authentication outcome arrives as an event (see `on`).
    async fn connect(&self, query: ConnectQuery) -> Result<(), SocketError>;

    /// Close the transport-level connection.
    async fn disconnect(&self);

    /// Emit a named event with a JSON payload, awaiting at most one ack
    /// response. Returns `None` if the remote never responds.
    async fn emit(&self, event_name: &str, payload: serde_json::Value) -> Option<serde_json::Value>;

    /// Register a handler for a named inbound event. Replaces any handler
    /// previously registered for the same name.
    fn on(&self, event_name: &str, handler: EventHandler);

    fn connected(&self) -> bool;
}
