//! In-memory provider implementations: a signaling switch that connects
//! multiple fake Nodes without a socket, and a fake peer-connection/data-
//! channel pair that completes offer/answer synchronously.
//!
//! This is the harness the integration tests in `tests/` drive against —
//! grounded on the "dynamic dispatch to provider contracts ... one
//! production implementation plus one test-harness implementation" design
//! note. It intentionally does not model real SDP or ICE semantics: the
//! fake peer connections correlate an offer/answer pair via a token
//! embedded in the (otherwise opaque) SDP string, which is sufficient to
//! drive the signaling state machine deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::{IceCandidate, SdpKind, SessionDescription};
use crate::provider::rtc::{
    ConnectionState, DataChannel, DataChannelObserver, DataChannelState, PeerConnection,
    PeerConnectionFactory, PeerConnectionObserver, ProviderError,
};
use crate::provider::signaling::{ConnectQuery, EventHandler, SignalingSocket, SocketError};
use crate::provider::support::RtcConfiguration;

// ---------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------

struct RegisteredClient {
    socket: Arc<InMemorySocket>,
}

/// A broker-side rejection or transport loss to simulate on a client's next
/// `connect()` attempt, for reconnection-path tests. One-shot: consumed the
/// moment that attempt runs.
#[derive(Debug, Clone, Copy)]
pub enum InjectedFault {
    SocketError,
    Unauthorized,
    ClientAlreadyConnected,
}

/// Shared switch that routes emits between [`InMemorySocket`]s registered
/// under it, standing in for a real broker process.
pub struct InMemoryBroker {
    clients: Mutex<HashMap<String, RegisteredClient>>,
    rtc_config_json: serde_json::Value,
    injected_faults: Mutex<HashMap<String, InjectedFault>>,
}

impl InMemoryBroker {
    pub fn new(rtc_config_json: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            rtc_config_json,
            injected_faults: Mutex::new(HashMap::new()),
        })
    }

    /// Create a socket bound to this broker; not yet connected.
    pub fn create_socket(self: &Arc<Self>) -> Arc<InMemorySocket> {
        let broker = self.clone();
        Arc::new_cyclic(|weak| InMemorySocket {
            broker,
            self_weak: Mutex::new(weak.clone()),
            id: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            connected: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn is_connected(&self, id: &str) -> bool {
        self.clients.lock().contains_key(id)
    }

    fn deliver(&self, to: &str, event_name: &str, payload: serde_json::Value) -> Option<serde_json::Value> {
        let socket = self.clients.lock().get(to).map(|c| c.socket.clone())?;
        let handler = socket.handlers.lock().get(event_name).cloned();
        if let Some(handler) = handler {
            handler(payload);
            Some(serde_json::json!("OK"))
        } else {
            None
        }
    }

    /// Test support: the next `connect()` attempt made under `id` fails
    /// with `fault` instead of succeeding, standing in for a broker-side
    /// auth rejection or a dropped transport.
    pub fn inject_connect_fault(&self, id: &str, fault: InjectedFault) {
        self.injected_faults.lock().insert(id.to_string(), fault);
    }

    /// Test support: simulates the broker unilaterally dropping an
    /// already-connected client's transport, firing `disconnect` the way a
    /// severed websocket would.
    pub fn force_disconnect(&self, id: &str) {
        let Some(client) = self.clients.lock().remove(id) else { return };
        client.socket.connected.store(false, Ordering::SeqCst);
        client.socket.fire("disconnect", serde_json::Value::Null);
    }
}

pub struct InMemorySocket {
    broker: Arc<InMemoryBroker>,
    self_weak: Mutex<Weak<InMemorySocket>>,
    id: Mutex<Option<String>>,
    handlers: Mutex<HashMap<String, Arc<dyn Fn(serde_json::Value) + Send + Sync>>>,
    connected: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl SignalingSocket for InMemorySocket {
    async fn connect(&self, query: ConnectQuery) -> Result<(), SocketError> {
        if let Some(fault) = self.broker.injected_faults.lock().remove(&query.id) {
            let payload = match fault {
                InjectedFault::SocketError => serde_json::json!({}),
                InjectedFault::Unauthorized => serde_json::json!({ "message": "authentication failed" }),
                InjectedFault::ClientAlreadyConnected => serde_json::json!({ "message": "client already connected" }),
            };
            self.fire("connect_error", payload);
            return Ok(());
        }
        let mut clients = self.broker.clients.lock();
        if clients.contains_key(&query.id) {
            drop(clients);
            self.fire("connect_error", serde_json::json!({ "message": "client already connected" }));
            return Ok(());
        }
        let strong = self
            .self_weak
            .lock()
            .upgrade()
            .ok_or_else(|| SocketError::Transport("socket dropped".into()))?;
        clients.insert(query.id.clone(), RegisteredClient { socket: strong });
        drop(clients);
        self.id.lock().replace(query.id.clone());
        self.connected.store(true, Ordering::SeqCst);
        self.fire("AUTHENTICATED", self.broker.rtc_config_json.clone());
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(id) = self.id.lock().take() {
            self.broker.clients.lock().remove(&id);
        }
        self.connected.store(false, Ordering::SeqCst);
        self.fire("disconnect", serde_json::Value::Null);
    }

    async fn emit(&self, event_name: &str, payload: serde_json::Value) -> Option<serde_json::Value> {
        if event_name == "ARE_NODES_CONNECTED_TO_BROKER" {
            let ids: Vec<String> = payload
                .get("ids")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                .unwrap_or_default();
            let results: Vec<serde_json::Value> = ids
                .iter()
                .map(|id| serde_json::json!({ "id": id, "connected": self.broker.is_connected(id) }))
                .collect();
            return Some(serde_json::json!({ "results": results }));
        }
        let to = payload.get("to").and_then(|v| v.as_str())?.to_string();
        if !self.broker.is_connected(&to) {
            return Some(serde_json::json!({ "error": "NOT_CONNECTED" }));
        }
        Some(
            self.broker
                .deliver(&to, event_name, payload)
                .unwrap_or_else(|| serde_json::json!({ "error": "NOT_CONNECTED" })),
        )
    }

    fn on(&self, event_name: &str, handler: EventHandler) {
        self.handlers.lock().insert(event_name.to_string(), Arc::from(handler));
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl InMemorySocket {
    fn fire(&self, event_name: &str, payload: serde_json::Value) {
        if let Some(handler) = self.handlers.lock().get(event_name).cloned() {
            handler(payload);
        }
    }
}

// ---------------------------------------------------------------------
// WebRTC
// ---------------------------------------------------------------------

struct PendingOffer {
    pc: Arc<InMemoryPeerConnection>,
}

/// Correlates the two fake peer connections of a pairing via a token
/// embedded in the offer's SDP string.
pub struct RtcHub {
    pending: Mutex<HashMap<String, PendingOffer>>,
}

impl RtcHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn link(&self, offer_sdp: &str, pc_b: &Arc<InMemoryPeerConnection>) {
        let Some(token) = offer_sdp.strip_prefix("fake-offer:") else {
            return;
        };
        let Some(pending) = self.pending.lock().remove(token) else {
            return;
        };
        let pc_a = pending.pc;
        *pc_a.remote.lock() = Some(pc_b.clone());
        *pc_b.remote.lock() = Some(pc_a.clone());
        pc_a.set_connection_state(ConnectionState::Connected);
        pc_b.set_connection_state(ConnectionState::Connected);

        let dc_a = pc_a.data_channel.lock().clone();
        if let Some(dc_a) = dc_a {
            let dc_b = InMemoryDataChannel::paired_with(&dc_a);
            *pc_b.data_channel.lock() = Some(dc_b.clone());
            pc_b.observer.on_data_channel(dc_b.clone());
            dc_a.open();
            dc_b.open();
        }
    }
}

pub struct InMemoryRtcFactory {
    hub: Arc<RtcHub>,
}

impl InMemoryRtcFactory {
    pub fn new(hub: Arc<RtcHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl PeerConnectionFactory for InMemoryRtcFactory {
    async fn create(
        &self,
        _config: RtcConfiguration,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>, ProviderError> {
        Ok(InMemoryPeerConnection::new(self.hub.clone(), observer))
    }
}

struct InMemoryPeerConnection {
    hub: Arc<RtcHub>,
    observer: Arc<dyn PeerConnectionObserver>,
    self_weak: Mutex<Weak<InMemoryPeerConnection>>,
    remote: Mutex<Option<Arc<InMemoryPeerConnection>>>,
    data_channel: Mutex<Option<Arc<InMemoryDataChannel>>>,
    connection_state: Mutex<ConnectionState>,
}

impl InMemoryPeerConnection {
    fn new(hub: Arc<RtcHub>, observer: Arc<dyn PeerConnectionObserver>) -> Arc<dyn PeerConnection> {
        let arc = Arc::new_cyclic(|weak| Self {
            hub,
            observer,
            self_weak: Mutex::new(weak.clone()),
            remote: Mutex::new(None),
            data_channel: Mutex::new(None),
            connection_state: Mutex::new(ConnectionState::New),
        });
        arc as Arc<dyn PeerConnection>
    }

    fn set_connection_state(&self, state: ConnectionState) {
        *self.connection_state.lock() = state;
        self.observer.on_connection_state_change(state);
    }
}

#[async_trait]
impl PeerConnection for InMemoryPeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, ProviderError> {
        let dc = InMemoryDataChannel::new(label);
        *self.data_channel.lock() = Some(dc.clone());
        Ok(dc)
    }

    async fn create_offer(&self) -> Result<SessionDescription, ProviderError> {
        let token = Uuid::new_v4().to_string();
        let strong = self
            .self_weak
            .lock()
            .upgrade()
            .ok_or_else(|| ProviderError::PeerConnection("peer connection dropped".into()))?;
        self.hub.pending.lock().insert(token.clone(), PendingOffer { pc: strong });
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("fake-offer:{token}"),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "fake-answer".to_string(),
        })
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ProviderError> {
        if desc.kind == SdpKind::Offer {
            let strong = self
                .self_weak
                .lock()
                .upgrade()
                .ok_or_else(|| ProviderError::PeerConnection("peer connection dropped".into()))?;
            self.hub.link(&desc.sdp, &strong);
        }
        Ok(())
    }

    fn add_ice_candidate(&self, _candidate: IceCandidate) {}

    fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock()
    }

    fn close(&self) {
        self.set_connection_state(ConnectionState::Closed);
        if let Some(dc) = self.data_channel.lock().clone() {
            dc.close();
        }
    }
}

struct InMemoryDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    buffered_amount: AtomicU64,
    observer: Mutex<Option<Arc<dyn DataChannelObserver>>>,
    peer: Mutex<Weak<InMemoryDataChannel>>,
}

impl InMemoryDataChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            buffered_amount: AtomicU64::new(0),
            observer: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
        })
    }

    fn paired_with(other: &Arc<Self>) -> Arc<Self> {
        let mine = Self::new(&other.label);
        *other.peer.lock() = Arc::downgrade(&mine);
        *mine.peer.lock() = Arc::downgrade(other);
        mine
    }

    fn open(self: &Arc<Self>) {
        *self.state.lock() = DataChannelState::Open;
        if let Some(obs) = self.observer.lock().clone() {
            obs.on_state_change(DataChannelState::Open);
        }
    }
}

impl DataChannel for InMemoryDataChannel {
    fn state(&self) -> DataChannelState {
        *self.state.lock()
    }

    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), ProviderError> {
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| ProviderError::DataChannel("peer data channel closed".into()))?;
        if let Some(obs) = peer.observer.lock().clone() {
            obs.on_message(bytes);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    fn close(&self) {
        *self.state.lock() = DataChannelState::Closed;
        if let Some(peer) = self.peer.lock().upgrade() {
            *peer.state.lock() = DataChannelState::Closed;
            if let Some(obs) = peer.observer.lock().clone() {
                obs.on_state_change(DataChannelState::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct RecordingPcObserver {
        got_data_channel: Arc<AtomicBool>,
    }

    impl PeerConnectionObserver for RecordingPcObserver {
        fn on_ice_candidate(&self, _candidate: IceCandidate) {}
        fn on_connection_state_change(&self, _state: ConnectionState) {}
        fn on_data_channel(&self, _channel: Arc<dyn DataChannel>) {
            self.got_data_channel.store(true, Ordering::SeqCst);
        }
    }

    struct NullDcObserver;
    impl DataChannelObserver for NullDcObserver {
        fn on_state_change(&self, _state: DataChannelState) {}
        fn on_message(&self, _bytes: Vec<u8>) {}
    }

    #[tokio::test]
    async fn offer_answer_links_peer_connections_and_data_channel() {
        let hub = RtcHub::new();
        let factory = InMemoryRtcFactory::new(hub);

        let a_flag = Arc::new(AtomicBool::new(false));
        let b_flag = Arc::new(AtomicBool::new(false));
        let pc_a = factory
            .create(
                dummy_rtc_config(),
                Arc::new(RecordingPcObserver { got_data_channel: a_flag.clone() }),
            )
            .await
            .unwrap();
        let pc_b = factory
            .create(
                dummy_rtc_config(),
                Arc::new(RecordingPcObserver { got_data_channel: b_flag.clone() }),
            )
            .await
            .unwrap();

        let dc_a = pc_a.create_data_channel("data").unwrap();
        dc_a.register_observer(Arc::new(NullDcObserver));
        let offer = pc_a.create_offer().await.unwrap();
        pc_b.set_remote_description(offer).await.unwrap();

        assert!(b_flag.load(Ordering::SeqCst));
        assert_eq!(pc_a.connection_state(), ConnectionState::Connected);
        assert_eq!(pc_b.connection_state(), ConnectionState::Connected);
        assert_eq!(dc_a.state(), DataChannelState::Open);
    }

    fn dummy_rtc_config() -> RtcConfiguration {
        use crate::provider::support::{BundlePolicy, IceTransportPolicy, RtcpMuxPolicy};
        RtcConfiguration {
            ice_servers: vec![],
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::Balanced,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
        }
    }

    #[tokio::test]
    async fn broker_routes_direct_messages_between_connected_sockets() {
        let broker = InMemoryBroker::new(serde_json::json!({
            "iceServers": [],
            "iceTransportPolicy": "ALL",
            "bundlePolicy": "BALANCED",
            "rtcpMuxPolicy": "REQUIRE",
        }));
        let alice = broker.create_socket();
        let bob = broker.create_socket();

        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        bob.on(
            "SOCKET_MSG_EXCHANGE",
            Box::new(move |payload| {
                *received2.lock() = Some(payload);
            }),
        );

        alice
            .connect(ConnectQuery {
                id: "alice".into(),
                version: "1".into(),
                runtime: "test".into(),
                data: None,
            })
            .await
            .unwrap();
        bob.connect(ConnectQuery {
            id: "bob".into(),
            version: "1".into(),
            runtime: "test".into(),
            data: None,
        })
        .await
        .unwrap();

        let ack = alice
            .emit(
                "SOCKET_MSG_EXCHANGE",
                serde_json::json!({ "from": "alice", "to": "bob", "channel": "chat", "msg": "hi" }),
            )
            .await;
        assert_eq!(ack, Some(serde_json::json!("OK")));
        assert!(received.lock().is_some());
    }

    #[tokio::test]
    async fn injected_fault_reports_connect_error_instead_of_authenticating() {
        let broker = InMemoryBroker::new(serde_json::json!({}));
        let alice = broker.create_socket();
        let got_error = Arc::new(Mutex::new(None));
        let got_error2 = got_error.clone();
        alice.on(
            "connect_error",
            Box::new(move |payload| {
                *got_error2.lock() = Some(payload);
            }),
        );
        broker.inject_connect_fault("alice", InjectedFault::Unauthorized);
        alice
            .connect(ConnectQuery { id: "alice".into(), version: "1".into(), runtime: "test".into(), data: None })
            .await
            .unwrap();
        assert_eq!(
            got_error.lock().take(),
            Some(serde_json::json!({ "message": "authentication failed" }))
        );
        assert!(!broker.is_connected("alice"));
    }

    #[tokio::test]
    async fn force_disconnect_fires_disconnect_on_the_target_socket() {
        let broker = InMemoryBroker::new(serde_json::json!({}));
        let alice = broker.create_socket();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        alice.on("disconnect", Box::new(move |_| fired2.store(true, Ordering::SeqCst)));
        alice
            .connect(ConnectQuery { id: "alice".into(), version: "1".into(), runtime: "test".into(), data: None })
            .await
            .unwrap();
        assert!(broker.is_connected("alice"));
        broker.force_disconnect("alice");
        assert!(fired.load(Ordering::SeqCst));
        assert!(!broker.is_connected("alice"));
    }

    #[tokio::test]
    async fn emit_to_unconnected_target_reports_not_connected() {
        let broker = InMemoryBroker::new(serde_json::json!({}));
        let alice = broker.create_socket();
        alice
            .connect(ConnectQuery {
                id: "alice".into(),
                version: "1".into(),
                runtime: "test".into(),
                data: None,
            })
            .await
            .unwrap();

        let ack = alice
            .emit(
                "CONNECTION_ATTEMPT",
                serde_json::json!({ "from": "alice", "to": "ghost" }),
            )
            .await;
        assert_eq!(ack, Some(serde_json::json!({ "error": "NOT_CONNECTED" })));
    }
}
