//! Public facade (§4.J): the [`Node`] handle and its [`NodeBuilder`].
//!
//! `Node` owns the sending half of the event loop's channel plus the
//! `JoinHandle` needed to await shutdown — the `Arc`-free analogue of the
//! teacher's `NetworkService` (cloning a `Node` is cheap via its own
//! `Clone` impl, same as cloning the teacher's `mpsc::Sender`). Every
//! mutating operation posts an [`Event`] and, where the spec calls for a
//! result, awaits a `oneshot::Receiver` released by the event loop —
//! the "synchronous facades wrapping async cores" pattern grounded on the
//! teacher's `oneshot`-based `NetworkService::find_peer`. `_sync` variants
//! wrap the `async fn` in `futures::executor::block_on` for callers on a
//! thread with no ambient tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot};

use crate::broker::lifecycle::BrokerCallbacks;
use crate::clock::{Clock, Spawner, TokioClock};
use crate::config::NodeConfig;
use crate::connect_attempt::{AttemptId, TargetOutcome};
use crate::error::{
    ConnectError, IncomingToggleError, InvoluntaryDisconnectCause, P2pConnectError,
    RemoteConnectivityError, SendError,
};
use crate::event_loop::{self, ConnectedMap, Event};
use crate::ids::NodeId;
use crate::node::record::{ConnectCallbacks, ConnectedNodeHandle, IncomingCallbacks};
use crate::provider::rtc::PeerConnectionFactory;
use crate::provider::signaling::SignalingSocket;
use crate::state::ClientState;

/// Optional callbacks/data accompanying a single `connect_to_broker` call
/// (the spec's `direct_msg_callbacks?`/`params?` arguments, bundled into one
/// struct since both are optional and broker-session-scoped).
#[derive(Clone, Default)]
pub struct BrokerConnectParams {
    /// Per-channel callbacks for inbound `SOCKET_MSG_EXCHANGE` relay
    /// messages, keyed by channel name.
    pub direct_msg_callbacks: HashMap<String, Arc<dyn Fn(&NodeId, &str) + Send + Sync>>,
    pub on_reconnection_attempt: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub on_successfully_reconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_involuntary_disconnection: Option<Arc<dyn Fn(InvoluntaryDisconnectCause) + Send + Sync>>,
}

impl BrokerConnectParams {
    fn into_broker_callbacks(self) -> (HashMap<String, Arc<dyn Fn(&NodeId, &str) + Send + Sync>>, BrokerCallbacks) {
        let callbacks = BrokerCallbacks {
            on_reconnection_attempt: self.on_reconnection_attempt.unwrap_or_else(|| Arc::new(|_| {})),
            on_successfully_reconnected: self.on_successfully_reconnected.unwrap_or_else(|| Arc::new(|| {})),
            on_involuntary_disconnection: self
                .on_involuntary_disconnection
                .unwrap_or_else(|| Arc::new(|_| {})),
        };
        (self.direct_msg_callbacks, callbacks)
    }
}

/// Fluent construction of a [`Node`]. Distinct from [`crate::config::NodeBuilder`]
/// (which only builds [`NodeConfig`]): this one also wires in the provider
/// implementations and identity, since those are infra rather than tunables.
pub struct NodeBuilder {
    config: NodeConfig,
    platform: String,
    version: String,
    clock: Arc<dyn Clock>,
    spawner: Arc<dyn Spawner>,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        let tokio_clock: Arc<TokioClock> = Arc::new(TokioClock);
        Self {
            config: NodeConfig::default(),
            platform: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            clock: tokio_clock.clone(),
            spawner: tokio_clock,
        }
    }
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Override the time/execution provider (§4.B). Only useful for tests
    /// that need virtual time; production callers use the default
    /// [`TokioClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>, spawner: Arc<dyn Spawner>) -> Self {
        self.clock = clock;
        self.spawner = spawner;
        self
    }

    /// Build the [`Node`] and spawn its event loop task. Takes the two
    /// provider implementations (§4.B) — production adapters behind the
    /// `native-rtc`/`ws-signaling` features, or [`crate::provider::testing`]
    /// fakes for tests.
    pub fn build(self, rtc_factory: Arc<dyn PeerConnectionFactory>, socket: Arc<dyn SignalingSocket>) -> Node {
        let local_connected_flag = Arc::new(AtomicBool::new(false));
        let state = ClientState::new(
            self.config,
            self.clock,
            self.spawner,
            rtc_factory,
            socket,
            self.platform,
            self.version,
            local_connected_flag.clone(),
        );
        let handle = event_loop::spawn(state);
        Node {
            tx: handle.tx,
            join: Arc::new(SyncMutex::new(Some(handle.join))),
            local_connected_flag,
        }
    }
}

/// Handle to a running Node (§4.J). Cheap to clone; every clone shares the
/// same event loop task.
#[derive(Clone)]
pub struct Node {
    tx: mpsc::UnboundedSender<Event>,
    join: Arc<SyncMutex<Option<tokio::task::JoinHandle<()>>>>,
    local_connected_flag: Arc<AtomicBool>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    fn post(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Synchronous, non-blocking: mirrors the event loop's `broker`/
    /// `local_id` without a channel round-trip (§4.C's shared-flag design
    /// note).
    pub fn is_local_connected(&self) -> bool {
        self.local_connected_flag.load(Ordering::SeqCst)
    }

    pub async fn is_remote_connected(&self, id: NodeId) -> Result<bool, RemoteConnectivityError> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::IsRemoteConnected { id, reply });
        rx.await.unwrap_or(Err(RemoteConnectivityError::UnknownError))
    }

    pub async fn are_remotes_connected(
        &self,
        ids: Vec<NodeId>,
    ) -> Result<HashMap<NodeId, bool>, RemoteConnectivityError> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::AreRemotesConnected { ids, reply });
        rx.await.unwrap_or(Err(RemoteConnectivityError::UnknownError))
    }

    pub async fn send_socket_msg(
        &self,
        to: NodeId,
        channel: impl Into<String>,
        msg: Option<String>,
    ) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::SendSocketMsg { to, channel: channel.into(), msg, reply });
        rx.await.unwrap_or(Err(SendError::Error))
    }

    /// Blocks until AUTHENTICATED or a connect error arrives (§4.J).
    pub async fn connect_to_broker(
        &self,
        addr: impl Into<String>,
        node_id: NodeId,
        auth: Option<serde_json::Value>,
        params: BrokerConnectParams,
    ) -> Result<(), ConnectError> {
        let (direct_msg_callbacks, broker_callbacks) = params.into_broker_callbacks();
        let (reply, rx) = oneshot::channel();
        self.post(Event::ConnectToBroker {
            addr: addr.into(),
            node_id,
            auth,
            direct_msg_callbacks,
            broker_callbacks,
            reply,
        });
        rx.await.unwrap_or(Err(ConnectError::UnknownError))
    }

    pub fn connect_to_broker_sync(
        &self,
        addr: impl Into<String>,
        node_id: NodeId,
        auth: Option<serde_json::Value>,
        params: BrokerConnectParams,
    ) -> Result<(), ConnectError> {
        futures::executor::block_on(self.connect_to_broker(addr, node_id, auth, params))
    }

    /// Idempotent (§4.J): disconnecting while already disconnected just
    /// resolves immediately once the event loop processes it.
    pub async fn disconnect_from_broker(&self) {
        let (reply, rx) = oneshot::channel();
        self.post(Event::DisconnectFromBroker { reply });
        let _ = rx.await;
    }

    pub fn disconnect_from_broker_sync(&self) {
        futures::executor::block_on(self.disconnect_from_broker())
    }

    pub async fn allow_incoming(&self, callbacks: IncomingCallbacks) -> Result<(), IncomingToggleError> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::AllowIncoming { callbacks, reply });
        rx.await.unwrap_or(Err(IncomingToggleError::NotConnectedToBroker))
    }

    pub fn stop_incoming(&self) {
        self.post(Event::StopIncoming);
    }

    pub async fn get_all_connected(&self) -> ConnectedMap {
        let (reply, rx) = oneshot::channel();
        self.post(Event::GetAllConnected { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn get_connected(&self, id: NodeId) -> Option<ConnectedNodeHandle> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::GetConnected { id, reply });
        rx.await.ok().flatten()
    }

    /// Non-blocking: returns the batch id immediately; `on_concluded` fires
    /// later, once every target resolves or `force_conclusion` is called
    /// (§4.G).
    pub async fn connect_to_multiple_async(
        &self,
        targets: HashMap<NodeId, ConnectCallbacks>,
        on_concluded: impl FnOnce(HashMap<NodeId, TargetOutcome>) + Send + 'static,
    ) -> AttemptId {
        let (reply, rx) = oneshot::channel();
        self.post(Event::ConnectToMultiple {
            targets,
            on_concluded: Box::new(on_concluded),
            reply,
        });
        rx.await.unwrap_or(AttemptId(0))
    }

    /// Blocks until the whole batch concludes, returning the aggregate
    /// outcome map.
    pub fn connect_to_multiple_sync(
        &self,
        targets: HashMap<NodeId, ConnectCallbacks>,
    ) -> HashMap<NodeId, TargetOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        futures::executor::block_on(async {
            self.connect_to_multiple_async(targets, move |outcomes| {
                let _ = done_tx.send(outcomes);
            })
            .await;
            done_rx.await.unwrap_or_default()
        })
    }

    /// Single-target convenience over `connect_to_multiple_async`.
    pub async fn connect_to_single_async(
        &self,
        id: NodeId,
        callbacks: ConnectCallbacks,
    ) -> Result<ConnectedNodeHandle, P2pConnectError> {
        let target_id = id.clone();
        let mut targets = HashMap::with_capacity(1);
        targets.insert(id, callbacks);

        let (done_tx, done_rx) = oneshot::channel();
        self.connect_to_multiple_async(targets, move |mut outcomes| {
            let _ = done_tx.send(outcomes.remove(&target_id));
        })
        .await;

        match done_rx.await.ok().flatten() {
            Some(TargetOutcome::Connected(handle)) => Ok(handle),
            Some(TargetOutcome::Failed(err)) => Err(err),
            None => Err(P2pConnectError::ConnectionNegotiationError),
        }
    }

    pub fn connect_to_single_sync(
        &self,
        id: NodeId,
        callbacks: ConnectCallbacks,
    ) -> Result<ConnectedNodeHandle, P2pConnectError> {
        futures::executor::block_on(self.connect_to_single_async(id, callbacks))
    }

    /// Marks every not-yet-resolved target of `attempt` as
    /// `CONNECTION_ATTEMPT_CLOSED_BY_USER_FORCEFULLY` and fires its
    /// `on_concluded` immediately (§4.G). Fire-and-forget: the event loop
    /// applies it on its next turn.
    pub fn force_conclusion(&self, attempt: AttemptId) {
        self.post(Event::ForceConclusion { attempt });
    }

    /// Tears the Node down cleanly: stops the event loop and waits for its
    /// task to finish. Distinct from `disconnect_from_broker`, which only
    /// tears down the broker session and leaves already-CONNECTED peers
    /// alive — grounded on the teacher's `NetworkService::stop`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Shutdown { reply });
        let _ = rx.await;
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }

    pub fn shutdown_sync(&self) {
        futures::executor::block_on(self.shutdown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{InMemoryBroker, InMemoryRtcFactory, RtcHub};

    fn dummy_rtc_config_json() -> serde_json::Value {
        serde_json::json!({
            "iceServers": [],
            "iceTransportPolicy": "ALL",
            "bundlePolicy": "BALANCED",
            "rtcpMuxPolicy": "REQUIRE",
        })
    }

    fn build_node(broker: &Arc<InMemoryBroker>) -> Node {
        let socket = broker.create_socket();
        let hub = RtcHub::new();
        let rtc_factory = Arc::new(InMemoryRtcFactory::new(hub));
        NodeBuilder::new().build(rtc_factory, socket)
    }

    #[tokio::test]
    async fn not_connected_initially() {
        let broker = InMemoryBroker::new(dummy_rtc_config_json());
        let node = build_node(&broker);
        assert!(!node.is_local_connected());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn connect_to_broker_reports_authenticated() {
        let broker = InMemoryBroker::new(dummy_rtc_config_json());
        let node = build_node(&broker);

        let result = node
            .connect_to_broker("wss://broker.example", NodeId::from("alice"), None, BrokerConnectParams::default())
            .await;
        assert!(result.is_ok());
        assert!(node.is_local_connected());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn connect_to_broker_twice_rejects_second_call() {
        let broker = InMemoryBroker::new(dummy_rtc_config_json());
        let node = build_node(&broker);

        node.connect_to_broker("addr", NodeId::from("alice"), None, BrokerConnectParams::default())
            .await
            .unwrap();
        let second = node
            .connect_to_broker("addr", NodeId::from("alice"), None, BrokerConnectParams::default())
            .await;
        assert_eq!(second, Err(ConnectError::LocalClientAlreadyConnected));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_from_broker_clears_local_connected() {
        let broker = InMemoryBroker::new(dummy_rtc_config_json());
        let node = build_node(&broker);
        node.connect_to_broker("addr", NodeId::from("alice"), None, BrokerConnectParams::default())
            .await
            .unwrap();
        node.disconnect_from_broker().await;
        assert!(!node.is_local_connected());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn send_socket_msg_before_connect_fails() {
        let broker = InMemoryBroker::new(dummy_rtc_config_json());
        let node = build_node(&broker);
        let result = node.send_socket_msg(NodeId::from("bob"), "chat", Some("hi".into())).await;
        assert_eq!(result, Err(SendError::NotConnectedToBroker));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn allow_incoming_requires_broker_connection() {
        let broker = InMemoryBroker::new(dummy_rtc_config_json());
        let node = build_node(&broker);
        let callbacks = IncomingCallbacks {
            on_connection_attempt: Arc::new(|_, _, _| true),
            on_connection_success: Arc::new(|_| {}),
            on_disconnection: Arc::new(|_| {}),
            on_new_msg: Arc::new(|_, _, _| {}),
        };
        let result = node.allow_incoming(callbacks).await;
        assert_eq!(result, Err(IncomingToggleError::NotConnectedToBroker));
        node.shutdown().await;
    }
}
