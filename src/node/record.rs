//! The Node record (§3) and its role-specific extensions.
//!
//! `NodeRecord<R>` carries every field the spec lists as common to both
//! roles; role-only fields (the initiator's batch bookkeeping, the
//! responder's lack thereof) live behind `R::Extra` so neither role pays
//! for `Option`-wrapped fields it never uses — the sealed-`Role` approach
//! flagged as an addition in SPEC_FULL §3.

use std::sync::Arc;
use std::time::Instant;

use crate::codec::{IceCandidate, SessionDescription};
use crate::error::{P2pConnectError, SendError};
use crate::framing::{self, InboundReassembler};
use crate::ids::{NodeId, SessionId};
use crate::node::fsm::NodeState;
use crate::provider::rtc::{DataChannel, PeerConnection};

/// Seals `Initiator`/`Responder` as the only two roles a `NodeRecord` can
/// take, with role-specific data as an associated type.
pub trait Role: Send + Sync + 'static {
    type Extra: Send + Sync;
}

pub struct Initiator;
pub struct Responder;

/// Per-target callbacks supplied to `connect_to_single/multiple`.
pub struct ConnectCallbacks {
    pub on_connection_success: Arc<dyn Fn(ConnectedNodeHandle) + Send + Sync>,
    pub on_connection_failed: Arc<dyn Fn(&NodeId, P2pConnectError) + Send + Sync>,
    pub on_disconnection: Arc<dyn Fn(&NodeId) + Send + Sync>,
    pub on_new_msg: Arc<dyn Fn(&str, &str) + Send + Sync>,
}

/// Global callbacks registered via `allow_incoming`, applied to every
/// inbound pairing while incoming connections remain allowed.
#[derive(Clone)]
pub struct IncomingCallbacks {
    /// The only user callback invoked synchronously on the event loop
    /// (§4.F responder accept flow, step iii).
    pub on_connection_attempt: Arc<dyn Fn(&NodeId, &str, &str) -> bool + Send + Sync>,
    pub on_connection_success: Arc<dyn Fn(ConnectedNodeHandle) + Send + Sync>,
    pub on_disconnection: Arc<dyn Fn(&NodeId) + Send + Sync>,
    pub on_new_msg: Arc<dyn Fn(&NodeId, &str, &str) + Send + Sync>,
}

pub struct InitiatorExtra {
    pub callbacks: ConnectCallbacks,
    pub batch: Arc<crate::connect_attempt::AttemptShared>,
}
impl Role for Initiator {
    type Extra = InitiatorExtra;
}

pub struct ResponderExtra;
impl Role for Responder {
    type Extra = ResponderExtra;
}

/// A handle to an established (CONNECTED) pairing, handed to user code via
/// `on_connection_success`/`get_connected`. Cloning is cheap; every clone
/// shares the same monotonic outbound `msg_id` counter and the same
/// underlying data channel.
#[derive(Clone)]
pub struct ConnectedNodeHandle {
    id: NodeId,
    data_channel: Arc<dyn DataChannel>,
    next_outgoing_msg_id: Arc<std::sync::atomic::AtomicI32>,
}

impl ConnectedNodeHandle {
    pub(crate) fn new(id: NodeId, data_channel: Arc<dyn DataChannel>) -> Self {
        Self {
            id,
            data_channel,
            next_outgoing_msg_id: Arc::new(std::sync::atomic::AtomicI32::new(0)),
        }
    }

    /// Build a handle that shares an already-existing msg_id counter, so
    /// repeated retrievals of the same pairing (`get_connected`,
    /// `get_all_connected`) hand back clones that count from wherever the
    /// first handle left off, not a counter reset to 0.
    pub(crate) fn from_shared_counter(
        id: NodeId,
        data_channel: Arc<dyn DataChannel>,
        next_outgoing_msg_id: Arc<std::sync::atomic::AtomicI32>,
    ) -> Self {
        Self {
            id,
            data_channel,
            next_outgoing_msg_id,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.data_channel.state(),
            crate::provider::rtc::DataChannelState::Open
        )
    }

    /// Split, frame, and send `payload` on `channel` over the data
    /// channel, applying the buffered-amount backpressure watermark
    /// (§4.E) before every frame. Safe to call from any thread; does not
    /// touch the event loop's owned state.
    pub async fn send(&self, channel: &str, payload: &str) -> Result<(), SendError> {
        if channel.is_empty() {
            return Err(SendError::EmptyChannel);
        }
        let msg_id = self
            .next_outgoing_msg_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let frames = framing::split_outbound(channel, msg_id, payload);
        for frame in frames {
            while self.data_channel.buffered_amount() > crate::config::MAX_BUFFERED_AMOUNT {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            let bytes = frame.encode().map_err(|_| SendError::Error)?;
            self.data_channel.send(bytes).map_err(|_| SendError::Error)?;
        }
        Ok(())
    }
}

/// One per remote peer (§3), generic over role.
pub struct NodeRecord<R: Role> {
    pub remote_id: NodeId,
    pub session_id: SessionId,
    pub remote_platform: Option<String>,
    pub remote_version: Option<String>,
    pub fsm_state: NodeState,
    pub peer_connection: Arc<dyn PeerConnection>,
    pub data_channel: Option<Arc<dyn DataChannel>>,
    /// Deadline for the scoped `connection_timeout` (§3). Checked, not
    /// actively cancelled, when the timer future fires — see
    /// `event_loop::handle_connection_timeout`.
    pub timeout_deadline: Instant,
    pub next_outgoing_msg_id: Arc<std::sync::atomic::AtomicI32>,
    pub incoming_multipart: InboundReassembler,
    pub suspended_outgoing_ice: Vec<IceCandidate>,
    pub suspended_incoming_ice: Vec<IceCandidate>,
    /// The offer (initiator) or answer (responder) most recently produced
    /// by `create_offer`/`create_answer`, held here between
    /// `set_local_description` succeeding and the corresponding signaling
    /// message being sent — both roles need the SDP again at that point
    /// and a local variable can't survive across the event-post boundary.
    pub pending_local_desc: Option<SessionDescription>,
    pub extra: R::Extra,
}

impl<R: Role> NodeRecord<R> {
    /// A handle to the established pairing, or `None` until `state ==
    /// Connected` — §3's "`data_channel` becomes observable (OPEN) iff
    /// `state` transitions to CONNECTED" applies to the handle exposed to
    /// user code, not to the internal provider object, which may exist
    /// earlier.
    pub fn connected_handle(&self) -> Option<ConnectedNodeHandle> {
        if self.fsm_state != NodeState::Connected {
            return None;
        }
        self.data_channel.clone().map(|dc| {
            ConnectedNodeHandle::from_shared_counter(
                self.remote_id.clone(),
                dc,
                self.next_outgoing_msg_id.clone(),
            )
        })
    }
}
