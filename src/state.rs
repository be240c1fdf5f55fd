//! Process-wide-in-name-only shared state (§4.C).
//!
//! The distilled spec describes a singleton; per §9's redesign guidance
//! this is instead an explicit handle (`ClientState`) owned exclusively by
//! the event loop task and threaded through via the `Event`s it processes
//! — never a `static`/`OnceCell` global, so multiple independent `Node`s
//! (and deterministic concurrent tests) coexist in one process.
//!
//! Lifecycle: `empty` at construction → populated by `flush()`'s inverse
//! (field assignment on `AUTHENTICATED`) → `flush()` clears everything
//! *except* the node tables, which survive until their owning records are
//! individually force-closed or their data channels close — matching the
//! spec's explicit carve-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::clock::{Clock, Spawner};
use crate::config::NodeConfig;
use crate::ids::NodeId;
use crate::node::record::{IncomingCallbacks, Initiator, NodeRecord, Responder};
use crate::provider::rtc::PeerConnectionFactory;
use crate::provider::signaling::SignalingSocket;
use crate::provider::support::RtcConfiguration;

/// Present iff the signaling socket is connected and authenticated (§3).
pub struct BrokerSession {
    pub addr: String,
    pub auth: Option<serde_json::Value>,
    pub rtc_config: RtcConfiguration,
}

/// Everything the event loop owns and mutates in place, one instance per
/// [`crate::facade::Node`].
pub struct ClientState {
    pub config: NodeConfig,
    pub clock: Arc<dyn Clock>,
    pub spawner: Arc<dyn Spawner>,
    pub rtc_factory: Arc<dyn PeerConnectionFactory>,
    pub socket: Arc<dyn SignalingSocket>,
    pub platform: String,
    pub version: String,

    pub local_id: Option<NodeId>,
    pub broker: Option<BrokerSession>,

    /// Set by `connect_to_broker` and consumed by `on_authenticated`; holds
    /// the identity/addr/auth a pending handshake will commit to
    /// `broker`/`local_id` once AUTHENTICATED arrives.
    pub pending_connect: Option<crate::broker::lifecycle::PendingConnect>,
    /// The sync/async facade's latch for the in-flight `connect_to_broker`
    /// call, released by the first AUTHENTICATED or connect-error.
    pub pending_connect_reply:
        Option<tokio::sync::oneshot::Sender<Result<(), crate::error::ConnectError>>>,
    /// User callbacks for broker lifecycle events, registered at
    /// `connect_to_broker` time. `flush()` clears this, but the retry gap
    /// between an involuntary disconnect and the next reconnect attempt
    /// never calls `flush()` (only a voluntary disconnect or a terminal
    /// give-up does), so callbacks are available for every
    /// `on_reconnection_attempt`/`on_successfully_reconnected` in between.
    pub broker_callbacks: Option<crate::broker::lifecycle::BrokerCallbacks>,
    /// Count of reconnection attempts made since the last successful
    /// AUTHENTICATED. Lives outside `BrokerSession` since it must persist
    /// across the gap where the socket is neither connected nor
    /// authenticated.
    pub reconnect_attempts: u32,

    pub initiators: HashMap<NodeId, NodeRecord<Initiator>>,
    pub responders: HashMap<NodeId, NodeRecord<Responder>>,

    /// `Some` iff `allow_incoming` has been called and not yet undone by
    /// `stop_incoming` or a broker flush.
    pub incoming_callbacks: Option<IncomingCallbacks>,

    /// Per-channel direct-relay callbacks registered at `connect_to_broker`
    /// time, invoked for inbound `SOCKET_MSG_EXCHANGE` messages.
    pub direct_msg_callbacks: HashMap<String, Arc<dyn Fn(&NodeId, &str) + Send + Sync>>,

    /// Set while a voluntary `disconnect_from_broker` is in flight; its
    /// presence is what distinguishes a voluntary from an involuntary
    /// socket disconnect event (§4.H).
    pub voluntary_disconnect_pending: bool,

    pub next_attempt_id: u64,

    /// Mirrors `is_local_connected()` outside the event loop so
    /// [`crate::facade::Node::is_local_connected`] can read it without a
    /// channel round-trip, matching the teacher's `NetworkService::running`
    /// shared-flag pattern.
    pub local_connected_flag: Arc<AtomicBool>,
}

impl ClientState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeConfig,
        clock: Arc<dyn Clock>,
        spawner: Arc<dyn Spawner>,
        rtc_factory: Arc<dyn PeerConnectionFactory>,
        socket: Arc<dyn SignalingSocket>,
        platform: String,
        version: String,
        local_connected_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            clock,
            spawner,
            rtc_factory,
            socket,
            platform,
            version,
            local_id: None,
            broker: None,
            pending_connect: None,
            pending_connect_reply: None,
            broker_callbacks: None,
            reconnect_attempts: 0,
            initiators: HashMap::new(),
            responders: HashMap::new(),
            incoming_callbacks: None,
            direct_msg_callbacks: HashMap::new(),
            voluntary_disconnect_pending: false,
            next_attempt_id: 0,
            local_connected_flag,
        }
    }

    pub fn is_local_connected(&self) -> bool {
        self.broker.is_some() && self.local_id.is_some()
    }

    /// Call whenever `broker`/`local_id` transition, so the mirrored flag
    /// never drifts from the fields it shadows.
    pub(crate) fn sync_local_connected_flag(&self) {
        self.local_connected_flag
            .store(self.is_local_connected(), Ordering::SeqCst);
    }

    /// Exactly one Node record per `remote_id` across initiator and
    /// responder tables combined (§3 invariant).
    pub fn has_node(&self, id: &NodeId) -> bool {
        self.initiators.contains_key(id) || self.responders.contains_key(id)
    }

    pub fn next_attempt_id(&mut self) -> crate::connect_attempt::AttemptId {
        let id = self.next_attempt_id;
        self.next_attempt_id += 1;
        crate::connect_attempt::AttemptId(id)
    }

    /// Flush on disconnect (§4.C): clears broker session, local identity,
    /// callbacks, and reconnection bookkeeping. Does NOT touch the node
    /// tables — connected peers are independent of the broker session.
    pub fn flush(&mut self) {
        self.broker = None;
        self.local_id = None;
        self.pending_connect = None;
        self.broker_callbacks = None;
        self.reconnect_attempts = 0;
        self.incoming_callbacks = None;
        self.direct_msg_callbacks.clear();
        self.voluntary_disconnect_pending = false;
        self.sync_local_connected_flag();
    }
}

pub(crate) fn mpsc_event_channel<T>() -> (mpsc::UnboundedSender<T>, mpsc::UnboundedReceiver<T>) {
    mpsc::unbounded_channel()
}
