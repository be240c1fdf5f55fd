//! Initiator-side transitions (§4.F, §4.G).
//!
//! `start_batch` is the entry point for `connect_to_multiple`; every other
//! function here is a continuation reached from [`crate::event_loop`] after
//! an async provider round-trip or an inbound signaling message completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::codec::signaling::{Envelope, SignalingMessage};
use crate::codec::{IceCandidate, SessionDescription};
use crate::connect_attempt::{AttemptId, AttemptShared, TargetOutcome};
use crate::error::P2pConnectError;
use crate::event_loop::{Event, SentKind};
use crate::framing::InboundReassembler;
use crate::ids::{NodeId, SessionId};
use crate::node::fsm::NodeState;
use crate::node::record::{ConnectCallbacks, Initiator, InitiatorExtra, NodeRecord};
use crate::node::{EventPostingDcObserver, EventPostingPcObserver};
use crate::provider::support::AckOutcome;
use crate::state::ClientState;

/// Validate and start a batch of connection attempts (§4.G). Targets that
/// fail the immediate checks are resolved right away; the rest get a
/// `NodeRecord` and are driven asynchronously. Returns the batch id.
pub async fn start_batch(
    state: &mut ClientState,
    tx: &UnboundedSender<Event>,
    targets: HashMap<NodeId, ConnectCallbacks>,
    on_concluded: Box<dyn FnOnce(HashMap<NodeId, TargetOutcome>) + Send>,
) -> AttemptId {
    let attempt_id = state.next_attempt_id();
    let spawner = state.spawner.clone();
    let wrapped: Box<dyn FnOnce(HashMap<NodeId, TargetOutcome>) + Send> = Box::new(move |outcomes| {
        spawner.spawn(Box::pin(async move { on_concluded(outcomes) }));
    });
    let shared = AttemptShared::new(attempt_id, targets.len(), wrapped);

    if !state.is_local_connected() {
        for (id, callbacks) in targets {
            shared.resolve_immediately(id.clone(), TargetOutcome::Failed(P2pConnectError::LocalNodeNotConnectedToBroker));
            dispatch_failed(state, &callbacks, &id, P2pConnectError::LocalNodeNotConnectedToBroker);
        }
        return attempt_id;
    }

    let local_id = state.local_id.clone().unwrap();
    let session_id = SessionId::generate();

    for (id, callbacks) in targets {
        if id == local_id {
            shared.resolve_immediately(id.clone(), TargetOutcome::Failed(P2pConnectError::TriedToConnectToSelf));
            dispatch_failed(state, &callbacks, &id, P2pConnectError::TriedToConnectToSelf);
            continue;
        }
        if state.has_node(&id) {
            shared.resolve_immediately(id.clone(), TargetOutcome::Failed(P2pConnectError::AlreadyConnectedToRemoteNode));
            dispatch_failed(state, &callbacks, &id, P2pConnectError::AlreadyConnectedToRemoteNode);
            continue;
        }

        shared.register_live(id.clone());
        spawn_target(state, tx, id, session_id, callbacks, shared.clone()).await;
    }

    attempt_id
}

fn dispatch_failed(state: &ClientState, callbacks: &ConnectCallbacks, id: &NodeId, reason: P2pConnectError) {
    let cb = callbacks.on_connection_failed.clone();
    let id = id.clone();
    state.spawner.spawn(Box::pin(async move {
        cb(&id, reason);
    }));
}

async fn spawn_target(
    state: &mut ClientState,
    tx: &UnboundedSender<Event>,
    id: NodeId,
    session_id: SessionId,
    callbacks: ConnectCallbacks,
    batch: Arc<AttemptShared>,
) {
    let rtc_config = state.broker.as_ref().unwrap().rtc_config.clone();
    let observer = Arc::new(EventPostingPcObserver { id: id.clone(), tx: tx.clone() });
    let pc = match state.rtc_factory.create(rtc_config, observer).await {
        Ok(pc) => pc,
        Err(_) => {
            batch.resolve(id.clone(), TargetOutcome::Failed(P2pConnectError::ConnectionNegotiationError));
            dispatch_failed(state, &callbacks, &id, P2pConnectError::ConnectionNegotiationError);
            return;
        }
    };
    let data_channel = match pc.create_data_channel("data") {
        Ok(dc) => dc,
        Err(_) => {
            batch.resolve(id.clone(), TargetOutcome::Failed(P2pConnectError::ConnectionNegotiationError));
            dispatch_failed(state, &callbacks, &id, P2pConnectError::ConnectionNegotiationError);
            return;
        }
    };
    data_channel.register_observer(Arc::new(EventPostingDcObserver { id: id.clone(), tx: tx.clone() }));

    let timeout_deadline = Instant::now() + state.config.p2p_connection_timeout;
    let record = NodeRecord::<Initiator> {
        remote_id: id.clone(),
        session_id,
        remote_platform: None,
        remote_version: None,
        fsm_state: NodeState::Created,
        peer_connection: pc.clone(),
        data_channel: Some(data_channel),
        timeout_deadline,
        next_outgoing_msg_id: Arc::new(std::sync::atomic::AtomicI32::new(0)),
        incoming_multipart: InboundReassembler::new(state.clock.clone(), state.config.multipart_msg_timeout),
        suspended_outgoing_ice: Vec::new(),
        suspended_incoming_ice: Vec::new(),
        pending_local_desc: None,
        extra: InitiatorExtra { callbacks, batch },
    };
    state.initiators.insert(id.clone(), record);

    schedule_timeout(state, tx, id.clone());

    let tx2 = tx.clone();
    let id2 = id.clone();
    state.spawner.spawn(Box::pin(async move {
        match pc.create_offer().await {
            Ok(desc) => {
                let _ = tx2.send(Event::OfferCreated { id: id2, desc });
            }
            Err(_) => {
                let _ = tx2.send(Event::OfferCreateFailed { id: id2 });
            }
        }
    }));
}

fn schedule_timeout(state: &ClientState, tx: &UnboundedSender<Event>, id: NodeId) {
    let clock = state.clock.clone();
    let duration = state.config.p2p_connection_timeout;
    let tx = tx.clone();
    state.spawner.spawn(Box::pin(async move {
        clock.sleep(duration).await;
        let _ = tx.send(Event::ConnectionTimeoutFired { id });
    }));
}

pub async fn on_offer_created(state: &mut ClientState, tx: &UnboundedSender<Event>, id: NodeId, desc: SessionDescription) {
    let Some(record) = state.initiators.get_mut(&id) else { return };
    record.pending_local_desc = Some(desc.clone());
    let pc = record.peer_connection.clone();
    let tx = tx.clone();
    state.spawner.spawn(Box::pin(async move {
        match pc.set_local_description(desc).await {
            Ok(()) => {
                let _ = tx.send(Event::LocalDescriptionSet { id });
            }
            Err(_) => {
                let _ = tx.send(Event::LocalDescriptionSetFailed { id });
            }
        }
    }));
}

pub fn on_offer_create_failed(state: &mut ClientState, id: NodeId) {
    fail_negotiation(state, id, P2pConnectError::ConnectionNegotiationError);
}

pub async fn on_local_description_set(state: &mut ClientState, tx: &UnboundedSender<Event>, id: NodeId) {
    let Some(record) = state.initiators.get_mut(&id) else { return };
    if record.fsm_state != NodeState::Created {
        return;
    }
    record.fsm_state = NodeState::DescriptionsExchange;
    let Some(offer) = record.pending_local_desc.take() else { return };
    let envelope = Envelope {
        platform_from: state.platform.clone(),
        version_from: state.version.clone(),
        from: state.local_id.clone().unwrap(),
        to: id.clone(),
        session_id: record.session_id,
    };
    let msg = SignalingMessage::ConnectionAttempt { envelope, session_description: offer };
    send_signaling(state, tx, id, "CONNECTION_ATTEMPT", &msg, SentKind::ConnectionAttempt);
}

fn send_signaling(
    state: &ClientState,
    tx: &UnboundedSender<Event>,
    id: NodeId,
    event_name: &'static str,
    msg: &SignalingMessage,
    kind: SentKind,
) {
    let payload = serde_json::to_value(msg).unwrap_or(serde_json::Value::Null);
    let socket = state.socket.clone();
    let tx = tx.clone();
    state.spawner.spawn(Box::pin(async move {
        let ack = socket.emit(event_name, payload).await;
        let outcome = crate::provider::support::classify_ack(ack.as_ref());
        let _ = tx.send(Event::SignalingSendAcked { id, kind, outcome });
    }));
}

pub async fn on_send_acked(
    state: &mut ClientState,
    tx: &UnboundedSender<Event>,
    id: NodeId,
    kind: SentKind,
    outcome: AckOutcome,
) {
    match kind {
        SentKind::ConnectionAttempt => {
            if outcome == AckOutcome::Error {
                fail_negotiation(state, id, P2pConnectError::RemoteNodeNotConnectedToBroker);
            }
        }
        SentKind::IceCandidate => {}
        SentKind::ConnectionAcceptance => {}
    }
    let _ = tx;
}

/// Router delivers `CONNECTION_ACCEPTANCE` here.
pub async fn on_connection_acceptance(
    state: &mut ClientState,
    tx: &UnboundedSender<Event>,
    id: NodeId,
    desc: SessionDescription,
) {
    let Some(record) = state.initiators.get_mut(&id) else { return };
    if record.fsm_state != NodeState::DescriptionsExchange {
        return;
    }
    let pc = record.peer_connection.clone();
    let tx = tx.clone();
    state.spawner.spawn(Box::pin(async move {
        match pc.set_remote_description(desc).await {
            Ok(()) => {
                let _ = tx.send(Event::RemoteDescriptionSet { id });
            }
            Err(_) => {
                let _ = tx.send(Event::RemoteDescriptionSetFailed { id });
            }
        }
    }));
}

pub async fn on_remote_description_set(state: &mut ClientState, tx: &UnboundedSender<Event>, id: NodeId) {
    let Some(record) = state.initiators.get_mut(&id) else { return };
    if record.fsm_state != NodeState::DescriptionsExchange {
        return;
    }
    record.fsm_state = NodeState::IceCandidatesExchange;

    let outgoing = std::mem::take(&mut record.suspended_outgoing_ice);
    for candidate in outgoing {
        send_ice(state, tx, id.clone(), candidate);
    }
    let record = state.initiators.get_mut(&id).unwrap();
    let incoming = std::mem::take(&mut record.suspended_incoming_ice);
    let pc = record.peer_connection.clone();
    for candidate in incoming {
        pc.add_ice_candidate(candidate);
    }
}

fn send_ice(state: &ClientState, tx: &UnboundedSender<Event>, id: NodeId, candidate: IceCandidate) {
    let Some(record) = state.initiators.get(&id) else { return };
    let envelope = Envelope {
        platform_from: state.platform.clone(),
        version_from: state.version.clone(),
        from: state.local_id.clone().unwrap(),
        to: id.clone(),
        session_id: record.session_id,
    };
    let msg = SignalingMessage::IceCandidateItoR { envelope, candidate };
    send_signaling(state, tx, id, "ICE_CANDIDATES_EXCHANGE_I_TO_R", &msg, SentKind::IceCandidate);
}

pub async fn on_ice_gathered(state: &mut ClientState, tx: &UnboundedSender<Event>, id: NodeId, candidate: IceCandidate) {
    let Some(record) = state.initiators.get_mut(&id) else { return };
    match record.fsm_state {
        NodeState::IceCandidatesExchange | NodeState::Connected => send_ice(state, tx, id, candidate),
        NodeState::DescriptionsExchange => record.suspended_outgoing_ice.push(candidate),
        _ => {}
    }
}

/// Router delivers `ICE_CANDIDATES_EXCHANGE_R_TO_I` here.
pub fn on_remote_ice_candidate(state: &mut ClientState, id: NodeId, candidate: IceCandidate) {
    let Some(record) = state.initiators.get_mut(&id) else { return };
    match record.fsm_state {
        NodeState::IceCandidatesExchange | NodeState::Connected => {
            record.peer_connection.add_ice_candidate(candidate);
        }
        NodeState::DescriptionsExchange => record.suspended_incoming_ice.push(candidate),
        _ => {}
    }
}

/// Router delivers `CONNECTION_REFUSAL` / `INCOMING_CONNECTIONS_NOT_ALLOWED` here.
pub fn on_remote_refused(state: &mut ClientState, id: NodeId, reason: P2pConnectError) {
    fail_negotiation(state, id, reason);
}

pub fn on_data_channel_open(state: &mut ClientState, id: NodeId) {
    let Some(record) = state.initiators.get_mut(&id) else { return };
    if !record.fsm_state.is_negotiating() {
        return;
    }
    record.fsm_state = NodeState::Connected;
    let Some(handle) = record.connected_handle() else { return };
    let cb = record.extra.callbacks.on_connection_success.clone();
    let batch = record.extra.batch.clone();
    let remote_id = id.clone();
    batch.resolve(remote_id, TargetOutcome::Connected(handle.clone()));
    state.spawner.spawn(Box::pin(async move {
        cb(handle);
    }));
}

/// Terminates the record into `NEGOTIATION_ERROR` (or `TIMEOUT` via
/// [`close_connected`]) and invokes `on_connection_failed` exactly once.
pub fn fail_negotiation(state: &mut ClientState, id: NodeId, reason: P2pConnectError) {
    let Some(record) = state.initiators.remove(&id) else { return };
    if !record.fsm_state.is_negotiating() {
        return;
    }
    record.peer_connection.close();
    if let Some(dc) = &record.data_channel {
        dc.close();
    }
    record.extra.batch.resolve(id.clone(), TargetOutcome::Failed(reason.clone()));
    let cb = record.extra.callbacks.on_connection_failed.clone();
    state.spawner.spawn(Box::pin(async move {
        cb(&id, reason);
    }));
}

/// `force_close(new_state)` (§4.F): idempotent terminal transition used for
/// TIMEOUT (still negotiating) and DISCONNECTED (post-CONNECTED). Removing
/// the record from the table makes repeat calls for the same id a no-op.
pub fn close_connected(state: &mut ClientState, id: NodeId, new_state: NodeState) {
    let Some(record) = state.initiators.remove(&id) else { return };
    let was_negotiating = record.fsm_state.is_negotiating();
    record.peer_connection.close();
    if let Some(dc) = &record.data_channel {
        dc.close();
    }
    if was_negotiating {
        let reason = if new_state == NodeState::Timeout {
            P2pConnectError::ConnectionTimeout
        } else {
            P2pConnectError::ConnectionNegotiationError
        };
        record.extra.batch.resolve(id.clone(), TargetOutcome::Failed(reason.clone()));
        let cb = record.extra.callbacks.on_connection_failed.clone();
        state.spawner.spawn(Box::pin(async move {
            cb(&id, reason);
        }));
    } else {
        let cb = record.extra.callbacks.on_disconnection.clone();
        state.spawner.spawn(Box::pin(async move {
            cb(&id);
        }));
    }
}

/// `force_conclusion()` (§4.G): unresolved (still-negotiating) initiators
/// in this batch are forced to DISCONNECTED and reported as
/// `ConnectionAttemptClosedByUserForcefully`; already-CONNECTED records in
/// the same batch are left untouched and stand as successes.
pub fn force_conclude(state: &mut ClientState, attempt: AttemptId) {
    let unresolved: Vec<NodeId> = state
        .initiators
        .iter()
        .filter(|(_, r)| r.extra.batch.id == attempt && r.fsm_state.is_negotiating())
        .map(|(id, _)| id.clone())
        .collect();
    let shared = state
        .initiators
        .values()
        .find(|r| r.extra.batch.id == attempt)
        .map(|r| r.extra.batch.clone());

    for id in unresolved {
        let Some(record) = state.initiators.remove(&id) else { continue };
        record.peer_connection.close();
        if let Some(dc) = &record.data_channel {
            dc.close();
        }
        record.extra.batch.resolve(
            id.clone(),
            TargetOutcome::Failed(P2pConnectError::ConnectionAttemptClosedByUserForcefully),
        );
        let cb = record.extra.callbacks.on_connection_failed.clone();
        state.spawner.spawn(Box::pin(async move {
            cb(&id, P2pConnectError::ConnectionAttemptClosedByUserForcefully);
        }));
    }

    // Targets that never got a live `NodeRecord` (immediate failures) are
    // already resolved; this just fires the aggregate callback now instead
    // of waiting for `missing` to reach zero naturally.
    if let Some(shared) = shared {
        shared.force_conclusion();
    }
}
