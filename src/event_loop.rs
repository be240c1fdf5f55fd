//! The single-threaded FIFO event loop (§4.A).
//!
//! One `tokio::spawn`-ed task owns [`ClientState`] outright and drains an
//! unbounded `mpsc::Receiver<Event>` in a `tokio::select!` loop, exactly as
//! the teacher's `network::event_loop::run_event_loop` drains a command
//! channel alongside the libp2p swarm stream — collapsed here to a single
//! channel since every external source (facade commands, socket callbacks,
//! provider callbacks, timers) already reduces to an `Event` post rather
//! than a second stream to `select!` over.
//!
//! I/O callbacks (from the socket and from WebRTC) never call in here
//! directly: they hold a clone of the `mpsc::UnboundedSender<Event>` and
//! post, per §4.A/§5's "must not block the worker" rule. A handler that
//! needs an async provider round-trip spawns it via `ClientState::spawner`
//! and posts the result back in as a further `Event` — the suspension
//! points of §5 "reduce to an enqueue-continue".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::codec::signaling::SignalingMessage;
use crate::codec::IceCandidate;
use crate::connect_attempt::AttemptId;
use crate::error::{ConnectError, IncomingToggleError, P2pConnectError, RemoteConnectivityError, SendError};
use crate::ids::NodeId;
use crate::node::record::{ConnectCallbacks, ConnectedNodeHandle, IncomingCallbacks};
use crate::provider::rtc::{ConnectionState, DataChannel, DataChannelState};
use crate::provider::support::AckOutcome;
use crate::state::ClientState;

use std::collections::HashMap;

/// Reply channel for `get_all_connected`/`get_connected`.
pub type ConnectedMap = HashMap<NodeId, ConnectedNodeHandle>;

/// What the provider layer or the facade posts into the loop. Grouped
/// roughly by source: facade commands, broker socket events, per-pair
/// provider continuations, and timers.
pub enum Event {
    // ---- facade commands -------------------------------------------------
    ConnectToBroker {
        addr: String,
        node_id: NodeId,
        auth: Option<serde_json::Value>,
        direct_msg_callbacks: HashMap<String, Arc<dyn Fn(&NodeId, &str) + Send + Sync>>,
        broker_callbacks: crate::broker::lifecycle::BrokerCallbacks,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    DisconnectFromBroker {
        reply: oneshot::Sender<()>,
    },
    AllowIncoming {
        callbacks: IncomingCallbacks,
        reply: oneshot::Sender<Result<(), IncomingToggleError>>,
    },
    StopIncoming,
    SendSocketMsg {
        to: NodeId,
        channel: String,
        msg: Option<String>,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    IsRemoteConnected {
        id: NodeId,
        reply: oneshot::Sender<Result<bool, RemoteConnectivityError>>,
    },
    AreRemotesConnected {
        ids: Vec<NodeId>,
        reply: oneshot::Sender<Result<HashMap<NodeId, bool>, RemoteConnectivityError>>,
    },
    ConnectToMultiple {
        targets: HashMap<NodeId, ConnectCallbacks>,
        on_concluded: Box<dyn FnOnce(HashMap<NodeId, crate::connect_attempt::TargetOutcome>) + Send>,
        reply: oneshot::Sender<AttemptId>,
    },
    ForceConclusion {
        attempt: AttemptId,
    },
    GetAllConnected {
        reply: oneshot::Sender<ConnectedMap>,
    },
    GetConnected {
        id: NodeId,
        reply: oneshot::Sender<Option<ConnectedNodeHandle>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    // ---- broker socket events --------------------------------------------
    SocketAuthenticated { rtc_config_json: serde_json::Value },
    SocketConnectError { raw: serde_json::Value },
    SocketDisconnected,
    SocketSignaling(SignalingMessage),

    // ---- broker lifecycle timers ------------------------------------------
    ReconnectTick,

    // ---- per-pair provider continuations, keyed by remote id -------------
    OfferCreated { id: NodeId, desc: crate::codec::SessionDescription },
    OfferCreateFailed { id: NodeId },
    AnswerCreated { id: NodeId, desc: crate::codec::SessionDescription },
    AnswerCreateFailed { id: NodeId },
    LocalDescriptionSet { id: NodeId },
    LocalDescriptionSetFailed { id: NodeId },
    RemoteDescriptionSet { id: NodeId },
    RemoteDescriptionSetFailed { id: NodeId },
    SignalingSendAcked { id: NodeId, kind: SentKind, outcome: AckOutcome },
    IceCandidateGathered { id: NodeId, candidate: IceCandidate },
    PeerConnectionStateChanged { id: NodeId, state: ConnectionState },
    DataChannelObserved { id: NodeId, channel: Arc<dyn DataChannel> },
    DataChannelStateChanged { id: NodeId, state: DataChannelState },
    DataChannelMessage { id: NodeId, bytes: Vec<u8> },
    ConnectionTimeoutFired { id: NodeId },
}

/// Which outbound signaling send an ack continuation belongs to, so the
/// handler knows which failure to report on a non-OK ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    ConnectionAttempt,
    ConnectionAcceptance,
    IceCandidate,
}

/// Handle to the running event loop task: the sending half of its channel
/// plus a join handle for `Node::shutdown`.
pub struct LoopHandle {
    pub tx: mpsc::UnboundedSender<Event>,
    pub join: tokio::task::JoinHandle<()>,
}

/// Spawn the event loop task, taking ownership of `state`. Returns a
/// handle the facade uses to post commands and to await shutdown.
pub fn spawn(mut state: ClientState) -> LoopHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let loop_tx = tx.clone();

    let join = tokio::spawn(async move {
        crate::broker::router::install(&state, loop_tx.clone());

        let mut reassembly_ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(Event::Shutdown { reply }) => {
                            let _ = reply.send(());
                            break;
                        }
                        Some(event) => dispatch(&mut state, &loop_tx, event).await,
                        None => break,
                    }
                }
                _ = reassembly_ticker.tick() => {
                    for record in state.initiators.values_mut() {
                        record.incoming_multipart.expire_stale();
                    }
                    for record in state.responders.values_mut() {
                        record.incoming_multipart.expire_stale();
                    }
                }
            }
        }
    });

    LoopHandle { tx, join }
}

/// Catch and log a handler fault rather than let it take the loop down —
/// §4.A: "swallows and logs handler exceptions but never terminates".
async fn dispatch(state: &mut ClientState, tx: &mpsc::UnboundedSender<Event>, event: Event) {
    if let Err(err) = handle(state, tx, event).await {
        tracing::debug!(%err, "event handler failed");
    }
}

async fn handle(
    state: &mut ClientState,
    tx: &mpsc::UnboundedSender<Event>,
    event: Event,
) -> Result<(), crate::error::CoreError> {
    match event {
        Event::Shutdown { .. } => unreachable!("handled in the select loop"),

        Event::ConnectToBroker { addr, node_id, auth, direct_msg_callbacks, broker_callbacks, reply } => {
            crate::broker::lifecycle::connect(
                state,
                tx,
                addr,
                node_id,
                auth,
                direct_msg_callbacks,
                broker_callbacks,
                reply,
            )
            .await;
        }
        Event::DisconnectFromBroker { reply } => {
            crate::broker::lifecycle::disconnect(state, tx, reply).await;
        }
        Event::SocketAuthenticated { rtc_config_json } => {
            crate::broker::lifecycle::on_authenticated(state, rtc_config_json);
        }
        Event::SocketConnectError { raw } => {
            crate::broker::lifecycle::on_connect_error(state, tx, &raw);
        }
        Event::SocketDisconnected => {
            crate::broker::lifecycle::on_involuntary_disconnect(state, tx).await;
        }
        Event::ReconnectTick => {
            crate::broker::lifecycle::on_reconnect_tick(state, tx).await;
        }

        Event::AllowIncoming { callbacks, reply } => {
            let outcome = if !state.is_local_connected() {
                Err(IncomingToggleError::NotConnectedToBroker)
            } else if state.incoming_callbacks.is_some() {
                Err(IncomingToggleError::IncomingConnectionsAlreadyAllowed)
            } else {
                state.incoming_callbacks = Some(callbacks);
                Ok(())
            };
            let _ = reply.send(outcome);
        }
        Event::StopIncoming => {
            state.incoming_callbacks = None;
        }

        Event::SendSocketMsg { to, channel, msg, reply } => {
            let outcome = send_socket_msg(state, to, channel, msg).await;
            let _ = reply.send(outcome);
        }
        Event::IsRemoteConnected { id, reply } => {
            let outcome = query_connectivity(state, &[id.clone()]).await.map(|m| m.get(&id).copied().unwrap_or(false));
            let _ = reply.send(outcome);
        }
        Event::AreRemotesConnected { ids, reply } => {
            let outcome = query_connectivity(state, &ids).await;
            let _ = reply.send(outcome);
        }

        Event::ConnectToMultiple { targets, on_concluded, reply } => {
            let attempt_id = crate::node::initiator::start_batch(state, tx, targets, on_concluded).await;
            let _ = reply.send(attempt_id);
        }
        Event::ForceConclusion { attempt } => {
            crate::node::initiator::force_conclude(state, attempt);
        }

        Event::GetAllConnected { reply } => {
            let mut map = ConnectedMap::new();
            for (id, record) in state.initiators.iter() {
                if let Some(h) = record.connected_handle() {
                    map.insert(id.clone(), h);
                }
            }
            for (id, record) in state.responders.iter() {
                if let Some(h) = record.connected_handle() {
                    map.insert(id.clone(), h);
                }
            }
            let _ = reply.send(map);
        }
        Event::GetConnected { id, reply } => {
            let handle = state
                .initiators
                .get(&id)
                .and_then(|r| r.connected_handle())
                .or_else(|| state.responders.get(&id).and_then(|r| r.connected_handle()));
            let _ = reply.send(handle);
        }

        Event::SocketSignaling(msg) => {
            crate::broker::router::route(state, tx, msg).await;
        }

        Event::OfferCreated { id, desc } => crate::node::initiator::on_offer_created(state, tx, id, desc).await,
        Event::OfferCreateFailed { id } => crate::node::initiator::on_offer_create_failed(state, id),
        Event::LocalDescriptionSet { id } => crate::node::initiator::on_local_description_set(state, tx, id).await,
        Event::LocalDescriptionSetFailed { id } => fail_negotiation_any_role(state, id),
        Event::RemoteDescriptionSet { id } => route_remote_description_set(state, tx, id).await,
        Event::RemoteDescriptionSetFailed { id } => fail_negotiation_any_role(state, id),
        Event::AnswerCreated { id, desc } => crate::node::responder::on_answer_created(state, tx, id, desc).await,
        Event::AnswerCreateFailed { id } => fail_negotiation_any_role(state, id),
        Event::SignalingSendAcked { id, kind, outcome } => {
            route_signaling_send_acked(state, tx, id, kind, outcome).await
        }
        Event::IceCandidateGathered { id, candidate } => {
            route_ice_gathered(state, tx, id, candidate).await
        }
        Event::PeerConnectionStateChanged { id, state: pc_state } => {
            route_pc_state_changed(state, id, pc_state)
        }
        Event::DataChannelObserved { id, channel } => {
            if let Some(record) = state.responders.get_mut(&id) {
                channel.register_observer(Arc::new(crate::node::EventPostingDcObserver {
                    id: id.clone(),
                    tx: tx.clone(),
                }));
                record.data_channel = Some(channel);
            }
        }
        Event::DataChannelStateChanged { id, state: dc_state } => {
            route_dc_state_changed(state, id, dc_state)
        }
        Event::DataChannelMessage { id, bytes } => route_dc_message(state, id, bytes),
        Event::ConnectionTimeoutFired { id } => route_timeout(state, id),
    }
    Ok(())
}

async fn send_socket_msg(
    state: &mut ClientState,
    to: NodeId,
    channel: String,
    msg: Option<String>,
) -> Result<(), SendError> {
    if !state.is_local_connected() {
        return Err(SendError::NotConnectedToBroker);
    }
    if channel.is_empty() {
        return Err(SendError::EmptyChannel);
    }
    if to.as_str().is_empty() {
        return Err(SendError::EmptyId);
    }
    if Some(&to) == state.local_id.as_ref() {
        return Err(SendError::TriedToSendMsgToSelf);
    }
    let from = state.local_id.clone().unwrap();
    let payload = serde_json::json!({
        "type": "SOCKET_MSG_EXCHANGE",
        "from": from,
        "to": to,
        "channel": channel,
        "msg": msg,
    });
    let ack = state.socket.emit("SOCKET_MSG_EXCHANGE", payload).await;
    match crate::provider::support::classify_ack(ack.as_ref()) {
        AckOutcome::Ok => Ok(()),
        AckOutcome::Error => Err(SendError::Error),
    }
}

async fn query_connectivity(
    state: &mut ClientState,
    ids: &[NodeId],
) -> Result<HashMap<NodeId, bool>, RemoteConnectivityError> {
    if !state.is_local_connected() {
        return Err(RemoteConnectivityError::NotConnectedToBroker);
    }
    let payload = serde_json::json!({ "ids": ids });
    let ack = state.socket.emit("ARE_NODES_CONNECTED_TO_BROKER", payload).await;
    let Some(ack) = ack else {
        return Err(RemoteConnectivityError::UnknownError);
    };
    let Some(results) = ack.get("results").and_then(|v| v.as_array()) else {
        return Err(RemoteConnectivityError::UnknownError);
    };
    let mut map = HashMap::new();
    for entry in results {
        let (Some(id), Some(connected)) = (
            entry.get("id").and_then(|v| v.as_str()),
            entry.get("connected").and_then(|v| v.as_bool()),
        ) else {
            continue;
        };
        map.insert(NodeId::from(id), connected);
    }
    Ok(map)
}

fn fail_negotiation_any_role(state: &mut ClientState, id: NodeId) {
    if state.initiators.contains_key(&id) {
        crate::node::initiator::fail_negotiation(state, id, P2pConnectError::ConnectionNegotiationError);
    } else if state.responders.contains_key(&id) {
        crate::node::responder::fail_negotiation(state, id);
    }
}

async fn route_remote_description_set(state: &mut ClientState, tx: &mpsc::UnboundedSender<Event>, id: NodeId) {
    if state.initiators.contains_key(&id) {
        crate::node::initiator::on_remote_description_set(state, tx, id).await;
    } else if state.responders.contains_key(&id) {
        crate::node::responder::on_remote_description_set(state, tx, id).await;
    }
}

async fn route_signaling_send_acked(
    state: &mut ClientState,
    tx: &mpsc::UnboundedSender<Event>,
    id: NodeId,
    kind: SentKind,
    outcome: AckOutcome,
) {
    if state.initiators.contains_key(&id) {
        crate::node::initiator::on_send_acked(state, tx, id, kind, outcome).await;
    } else if state.responders.contains_key(&id) {
        crate::node::responder::on_send_acked(state, id, kind, outcome);
    }
}

async fn route_ice_gathered(
    state: &mut ClientState,
    tx: &mpsc::UnboundedSender<Event>,
    id: NodeId,
    candidate: IceCandidate,
) {
    if state.initiators.contains_key(&id) {
        crate::node::initiator::on_ice_gathered(state, tx, id, candidate).await;
    } else if state.responders.contains_key(&id) {
        crate::node::responder::on_ice_gathered(state, tx, id, candidate).await;
    }
}

fn route_pc_state_changed(state: &mut ClientState, id: NodeId, pc_state: ConnectionState) {
    if matches!(pc_state, ConnectionState::Disconnected | ConnectionState::Failed) {
        if let Some(record) = state.initiators.get(&id) {
            if record.fsm_state.is_negotiating() {
                crate::node::initiator::fail_negotiation(state, id.clone(), P2pConnectError::ConnectionNegotiationError);
            } else if record.fsm_state == crate::node::fsm::NodeState::Connected {
                crate::node::initiator::close_connected(state, id, crate::node::fsm::NodeState::Disconnected);
            }
        } else if let Some(record) = state.responders.get(&id) {
            if record.fsm_state.is_negotiating() {
                crate::node::responder::fail_negotiation(state, id.clone());
            } else if record.fsm_state == crate::node::fsm::NodeState::Connected {
                crate::node::responder::close_connected(state, id, crate::node::fsm::NodeState::Disconnected);
            }
        }
    }
}

fn route_dc_state_changed(state: &mut ClientState, id: NodeId, dc_state: DataChannelState) {
    match dc_state {
        DataChannelState::Open => {
            if state.initiators.contains_key(&id) {
                crate::node::initiator::on_data_channel_open(state, id);
            } else if state.responders.contains_key(&id) {
                crate::node::responder::on_data_channel_open(state, id);
            }
        }
        DataChannelState::Closed => {
            if let Some(record) = state.initiators.get(&id) {
                if record.fsm_state.is_negotiating() {
                    crate::node::initiator::fail_negotiation(state, id, P2pConnectError::ConnectionNegotiationError);
                } else if record.fsm_state == crate::node::fsm::NodeState::Connected {
                    crate::node::initiator::close_connected(state, id, crate::node::fsm::NodeState::Disconnected);
                }
            } else if let Some(record) = state.responders.get(&id) {
                if record.fsm_state.is_negotiating() {
                    crate::node::responder::fail_negotiation(state, id);
                } else if record.fsm_state == crate::node::fsm::NodeState::Connected {
                    crate::node::responder::close_connected(state, id, crate::node::fsm::NodeState::Disconnected);
                }
            }
        }
        _ => {}
    }
}

fn route_dc_message(state: &mut ClientState, id: NodeId, bytes: Vec<u8>) {
    let Ok(frame) = crate::codec::Frame::decode(&bytes) else {
        tracing::debug!(%id, "dropping undecodable data-channel frame");
        return;
    };
    if !matches!(frame.msg_type, crate::codec::MsgType::UserMsg) {
        tracing::debug!(%id, "dropping frame of unrecognized msg_type");
        return;
    }
    let delivery = if let Some(record) = state.initiators.get_mut(&id) {
        Some((true, record.incoming_multipart.accept(frame)))
    } else {
        state.responders.get_mut(&id).map(|record| (false, record.incoming_multipart.accept(frame)))
    };
    let Some((is_initiator, delivery)) = delivery else {
        return;
    };
    match delivery {
        crate::framing::Delivery::Complete { channel, payload } => {
            if is_initiator {
                if let Some(record) = state.initiators.get(&id) {
                    let cb = record.extra.callbacks.on_new_msg.clone();
                    state.spawner.spawn(Box::pin(async move {
                        cb(&channel, &payload);
                    }));
                }
            } else if let Some(cb) = state.incoming_callbacks.as_ref().map(|c| c.on_new_msg.clone()) {
                let id2 = id.clone();
                state.spawner.spawn(Box::pin(async move {
                    cb(&id2, &channel, &payload);
                }));
            }
        }
        crate::framing::Delivery::Pending => {}
        crate::framing::Delivery::Dropped { reason } => {
            tracing::debug!(%id, reason, "dropped inbound data-channel message");
        }
    }
}

fn route_timeout(state: &mut ClientState, id: NodeId) {
    let now = std::time::Instant::now();
    if let Some(record) = state.initiators.get(&id) {
        if record.fsm_state.is_negotiating() && record.timeout_deadline <= now {
            crate::node::initiator::close_connected(state, id, crate::node::fsm::NodeState::Timeout);
        }
    } else if let Some(record) = state.responders.get(&id) {
        if record.fsm_state.is_negotiating() && record.timeout_deadline <= now {
            crate::node::responder::close_connected(state, id, crate::node::fsm::NodeState::Timeout);
        }
    }
}
