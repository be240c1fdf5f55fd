//! Per-pair state machine (§4.F): the Node record, its role-specific
//! initiator/responder transition handlers, and the plain `NodeState` enum
//! driving the happy path and its three terminal branches.

pub mod fsm;
pub mod initiator;
pub mod record;
pub mod responder;

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::codec::IceCandidate;
use crate::event_loop::Event;
use crate::ids::NodeId;
use crate::provider::rtc::{
    ConnectionState, DataChannel, DataChannelObserver, DataChannelState, PeerConnectionObserver,
};

/// `PeerConnectionObserver` that does nothing but post events into the
/// loop, per §4.A's "I/O callbacks post, never mutate" rule. One instance
/// is created per `NodeRecord` at construction time.
pub struct EventPostingPcObserver {
    pub id: NodeId,
    pub tx: UnboundedSender<Event>,
}

impl PeerConnectionObserver for EventPostingPcObserver {
    fn on_ice_candidate(&self, candidate: IceCandidate) {
        let _ = self.tx.send(Event::IceCandidateGathered {
            id: self.id.clone(),
            candidate,
        });
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        let _ = self.tx.send(Event::PeerConnectionStateChanged {
            id: self.id.clone(),
            state,
        });
    }

    fn on_data_channel(&self, channel: Arc<dyn DataChannel>) {
        let _ = self.tx.send(Event::DataChannelObserved {
            id: self.id.clone(),
            channel,
        });
    }
}

/// `DataChannelObserver` that does nothing but post events into the loop.
pub struct EventPostingDcObserver {
    pub id: NodeId,
    pub tx: UnboundedSender<Event>,
}

impl DataChannelObserver for EventPostingDcObserver {
    fn on_state_change(&self, state: DataChannelState) {
        let _ = self.tx.send(Event::DataChannelStateChanged {
            id: self.id.clone(),
            state,
        });
    }

    fn on_message(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(Event::DataChannelMessage {
            id: self.id.clone(),
            bytes,
        });
    }
}
