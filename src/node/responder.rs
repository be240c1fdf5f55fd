//! Responder-side transitions (§4.F responder accept flow).

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::codec::signaling::{Envelope, SignalingMessage};
use crate::codec::{IceCandidate, SessionDescription};
use crate::event_loop::{Event, SentKind};
use crate::framing::InboundReassembler;
use crate::ids::{NodeId, SessionId};
use crate::node::fsm::NodeState;
use crate::node::record::{NodeRecord, Responder, ResponderExtra};
use crate::node::{EventPostingDcObserver, EventPostingPcObserver};
use crate::provider::support::AckOutcome;
use crate::state::ClientState;

/// Entry point for an inbound `CONNECTION_ATTEMPT` (§4.F responder accept
/// flow, steps i–iv). `from`/`session_id`/the offer all come from the
/// already-validated [`SignalingMessage`].
pub async fn handle_connection_attempt(
    state: &mut ClientState,
    tx: &UnboundedSender<Event>,
    from: NodeId,
    platform_from: String,
    version_from: String,
    session_id: SessionId,
    offer: SessionDescription,
) {
    if state.incoming_callbacks.is_none() {
        reply_no_record(state, tx, &from, session_id, "INCOMING_CONNECTIONS_NOT_ALLOWED");
        return;
    }
    if state.has_node(&from) {
        tracing::debug!(%from, "dropping CONNECTION_ATTEMPT: already paired");
        return;
    }

    let callbacks = state.incoming_callbacks.clone().unwrap();
    let accepted = (callbacks.on_connection_attempt)(&from, &platform_from, &version_from);
    if !accepted {
        reply_no_record(state, tx, &from, session_id, "CONNECTION_REFUSAL");
        return;
    }

    let rtc_config = state.broker.as_ref().unwrap().rtc_config.clone();
    let observer = Arc::new(EventPostingPcObserver { id: from.clone(), tx: tx.clone() });
    let Ok(pc) = state.rtc_factory.create(rtc_config, observer).await else {
        reply_no_record(state, tx, &from, session_id, "CONNECTION_REFUSAL");
        return;
    };

    let timeout_deadline = Instant::now() + state.config.p2p_connection_timeout;
    let record = NodeRecord::<Responder> {
        remote_id: from.clone(),
        session_id,
        remote_platform: Some(platform_from),
        remote_version: Some(version_from),
        fsm_state: NodeState::Created,
        peer_connection: pc.clone(),
        data_channel: None,
        timeout_deadline,
        next_outgoing_msg_id: Arc::new(std::sync::atomic::AtomicI32::new(0)),
        incoming_multipart: InboundReassembler::new(state.clock.clone(), state.config.multipart_msg_timeout),
        suspended_outgoing_ice: Vec::new(),
        suspended_incoming_ice: Vec::new(),
        pending_local_desc: None,
        extra: ResponderExtra,
    };
    state.responders.insert(from.clone(), record);
    schedule_timeout(state, tx, from.clone());

    let tx2 = tx.clone();
    let id2 = from.clone();
    state.spawner.spawn(Box::pin(async move {
        match pc.set_remote_description(offer).await {
            Ok(()) => {
                let _ = tx2.send(Event::RemoteDescriptionSet { id: id2 });
            }
            Err(_) => {
                let _ = tx2.send(Event::RemoteDescriptionSetFailed { id: id2 });
            }
        }
    }));
}

fn reply_no_record(
    state: &ClientState,
    tx: &UnboundedSender<Event>,
    to: &NodeId,
    session_id: SessionId,
    kind: &'static str,
) {
    let envelope = Envelope {
        platform_from: state.platform.clone(),
        version_from: state.version.clone(),
        from: state.local_id.clone().unwrap(),
        to: to.clone(),
        session_id,
    };
    let msg = match kind {
        "CONNECTION_REFUSAL" => SignalingMessage::ConnectionRefusal { envelope },
        _ => SignalingMessage::IncomingConnectionsNotAllowed { envelope },
    };
    let payload = serde_json::to_value(&msg).unwrap_or(serde_json::Value::Null);
    let socket = state.socket.clone();
    state.spawner.spawn(Box::pin(async move {
        let _ = socket.emit(kind, payload).await;
    }));
    let _ = tx;
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

pub async fn on_remote_description_set(state: &mut ClientState, tx: &UnboundedSender<Event>, id: NodeId) {
    let Some(record) = state.responders.get_mut(&id) else { return };
    if record.fsm_state != NodeState::Created {
        return;
    }
    record.fsm_state = NodeState::DescriptionsExchange;
    let pc = record.peer_connection.clone();
    let tx = tx.clone();
    state.spawner.spawn(Box::pin(async move {
        match pc.create_answer().await {
            Ok(desc) => {
                let _ = tx.send(Event::AnswerCreated { id, desc });
            }
            Err(_) => {
                let _ = tx.send(Event::AnswerCreateFailed { id });
            }
        }
    }));
}

pub async fn on_answer_created(state: &mut ClientState, tx: &UnboundedSender<Event>, id: NodeId, desc: SessionDescription) {
    let Some(record) = state.responders.get_mut(&id) else { return };
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

pub async fn on_local_description_set(state: &mut ClientState, tx: &UnboundedSender<Event>, id: NodeId) {
    let Some(record) = state.responders.get_mut(&id) else { return };
    if record.fsm_state != NodeState::DescriptionsExchange {
        return;
    }
    let Some(answer) = record.pending_local_desc.take() else { return };
    let envelope = Envelope {
        platform_from: state.platform.clone(),
        version_from: state.version.clone(),
        from: state.local_id.clone().unwrap(),
        to: id.clone(),
        session_id: record.session_id,
    };
    let msg = SignalingMessage::ConnectionAcceptance { envelope, session_description: answer };
    send_signaling(state, tx, id, "CONNECTION_ACCEPTANCE", &msg, SentKind::ConnectionAcceptance);
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

pub fn on_send_acked(state: &mut ClientState, id: NodeId, kind: SentKind, outcome: AckOutcome) {
    match kind {
        SentKind::ConnectionAcceptance => {
            if outcome == AckOutcome::Error {
                fail_negotiation(state, id);
                return;
            }
            let Some(record) = state.responders.get_mut(&id) else { return };
            if record.fsm_state != NodeState::DescriptionsExchange {
                return;
            }
            record.fsm_state = NodeState::IceCandidatesExchange;
            let outgoing = std::mem::take(&mut record.suspended_outgoing_ice);
            let incoming = std::mem::take(&mut record.suspended_incoming_ice);
            let pc = record.peer_connection.clone();
            for candidate in incoming {
                pc.add_ice_candidate(candidate);
            }
            // Outgoing suspended candidates need the socket, so this step
            // can't happen inside this `&mut` borrow; flush via a second
            // pass after the borrow ends.
            flush_outgoing_ice(state, id, outgoing);
        }
        SentKind::ConnectionAttempt | SentKind::IceCandidate => {}
    }
}

fn flush_outgoing_ice(state: &mut ClientState, id: NodeId, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        send_ice_no_tx(state, id.clone(), candidate);
    }
}

fn send_ice_no_tx(state: &ClientState, id: NodeId, candidate: IceCandidate) {
    let Some(record) = state.responders.get(&id) else { return };
    let envelope = Envelope {
        platform_from: state.platform.clone(),
        version_from: state.version.clone(),
        from: state.local_id.clone().unwrap(),
        to: id.clone(),
        session_id: record.session_id,
    };
    let msg = SignalingMessage::IceCandidateRtoI { envelope, candidate };
    let payload = serde_json::to_value(&msg).unwrap_or(serde_json::Value::Null);
    let socket = state.socket.clone();
    state.spawner.spawn(Box::pin(async move {
        let _ = socket.emit("ICE_CANDIDATES_EXCHANGE_R_TO_I", payload).await;
    }));
}

pub async fn on_ice_gathered(state: &mut ClientState, _tx: &UnboundedSender<Event>, id: NodeId, candidate: IceCandidate) {
    let Some(record) = state.responders.get_mut(&id) else { return };
    match record.fsm_state {
        NodeState::IceCandidatesExchange | NodeState::Connected => send_ice_no_tx(state, id, candidate),
        NodeState::DescriptionsExchange => record.suspended_outgoing_ice.push(candidate),
        _ => {}
    }
}

/// Router delivers `ICE_CANDIDATES_EXCHANGE_I_TO_R` here.
pub fn on_remote_ice_candidate(state: &mut ClientState, id: NodeId, candidate: IceCandidate) {
    let Some(record) = state.responders.get_mut(&id) else { return };
    match record.fsm_state {
        NodeState::IceCandidatesExchange | NodeState::Connected => {
            record.peer_connection.add_ice_candidate(candidate);
        }
        NodeState::DescriptionsExchange => record.suspended_incoming_ice.push(candidate),
        _ => {}
    }
}

pub fn on_data_channel_open(state: &mut ClientState, id: NodeId) {
    let Some(record) = state.responders.get_mut(&id) else { return };
    if !record.fsm_state.is_negotiating() {
        return;
    }
    record.fsm_state = NodeState::Connected;
    let Some(handle) = record.connected_handle() else { return };
    let Some(callbacks) = state.incoming_callbacks.clone() else { return };
    state.spawner.spawn(Box::pin(async move {
        (callbacks.on_connection_success)(handle);
    }));
}

pub fn fail_negotiation(state: &mut ClientState, id: NodeId) {
    let Some(record) = state.responders.remove(&id) else { return };
    if !record.fsm_state.is_negotiating() {
        return;
    }
    record.peer_connection.close();
    if let Some(dc) = &record.data_channel {
        dc.close();
    }
    // The spec gives the responder no `on_connection_failed` callback of
    // its own (only the initiator reports P2pConnectError); a responder
    // whose negotiation fails simply never fires `on_connection_success`.
}

/// `force_close(new_state)` for the responder side.
pub fn close_connected(state: &mut ClientState, id: NodeId, new_state: NodeState) {
    let Some(record) = state.responders.remove(&id) else { return };
    let was_negotiating = record.fsm_state.is_negotiating();
    record.peer_connection.close();
    if let Some(dc) = &record.data_channel {
        dc.close();
    }
    if !was_negotiating {
        if let Some(callbacks) = state.incoming_callbacks.clone() {
            state.spawner.spawn(Box::pin(async move {
                (callbacks.on_disconnection)(&id);
            }));
        }
    }
    let _ = new_state;
}
