//! Broker connection lifecycle (§4.H): authenticated connect, involuntary
//! disconnection classification, bounded reconnection, graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::error::{ConnectError, InvoluntaryDisconnectCause};
use crate::event_loop::Event;
use crate::ids::NodeId;
use crate::provider::signaling::ConnectQuery;
use crate::provider::support::parse_rtc_configuration;
use crate::state::{BrokerSession, ClientState};

/// User callbacks for broker-wide lifecycle events, registered at
/// `connect_to_broker` time (the spec's `params?` argument).
#[derive(Clone)]
pub struct BrokerCallbacks {
    pub on_reconnection_attempt: Arc<dyn Fn(u32) + Send + Sync>,
    pub on_successfully_reconnected: Arc<dyn Fn() + Send + Sync>,
    pub on_involuntary_disconnection: Arc<dyn Fn(InvoluntaryDisconnectCause) + Send + Sync>,
}

/// Identity/addr/auth for a handshake in flight, committed to
/// `ClientState::broker`/`local_id` once AUTHENTICATED arrives.
pub struct PendingConnect {
    pub addr: String,
    pub node_id: NodeId,
    pub auth: Option<serde_json::Value>,
}

/// Voluntary `connect_to_broker` (§4.J). Rejects immediately if already
/// connected; otherwise stashes the pending identity and kicks off the
/// socket-level connect, whose outcome arrives later as `AUTHENTICATED` or
/// `connect_error` via the handlers `broker::router::install` registered.
#[allow(clippy::too_many_arguments)]
pub async fn connect(
    state: &mut ClientState,
    tx: &UnboundedSender<Event>,
    addr: String,
    node_id: NodeId,
    auth: Option<serde_json::Value>,
    direct_msg_callbacks: HashMap<String, Arc<dyn Fn(&NodeId, &str) + Send + Sync>>,
    broker_callbacks: BrokerCallbacks,
    reply: oneshot::Sender<Result<(), ConnectError>>,
) {
    if state.is_local_connected() {
        let _ = reply.send(Err(ConnectError::LocalClientAlreadyConnected));
        return;
    }

    state.pending_connect = Some(PendingConnect {
        addr,
        node_id: node_id.clone(),
        auth: auth.clone(),
    });
    state.direct_msg_callbacks = direct_msg_callbacks;
    state.broker_callbacks = Some(broker_callbacks);
    state.pending_connect_reply = Some(reply);

    dial(state, tx, node_id, auth).await;
}

async fn dial(state: &ClientState, tx: &UnboundedSender<Event>, node_id: NodeId, auth: Option<serde_json::Value>) {
    let query = ConnectQuery {
        id: node_id.as_str().to_string(),
        version: state.version.clone(),
        runtime: state.platform.clone(),
        data: auth,
    };
    let socket = state.socket.clone();
    let tx = tx.clone();
    state.spawner.spawn(Box::pin(async move {
        if socket.connect(query).await.is_err() {
            let _ = tx.send(Event::SocketConnectError {
                raw: serde_json::json!({ "transport": "connect_failed" }),
            });
        }
    }));
}

/// `AUTHENTICATED` (§4.H): commits the pending identity, parses the RTC
/// configuration, and releases whichever latch is waiting — the initial
/// `connect_to_broker` caller, or nobody (a reconnect), in which case
/// `on_successfully_reconnected` fires instead.
pub fn on_authenticated(state: &mut ClientState, rtc_config_json: serde_json::Value) {
    let Some(pending) = state.pending_connect.take() else {
        tracing::debug!("AUTHENTICATED received with no pending connect");
        return;
    };
    let is_reconnect = state.reconnect_attempts > 0;

    match parse_rtc_configuration(&rtc_config_json) {
        Ok(rtc_config) => {
            state.local_id = Some(pending.node_id);
            state.broker = Some(BrokerSession {
                addr: pending.addr,
                auth: pending.auth,
                rtc_config,
            });
            state.reconnect_attempts = 0;
            state.sync_local_connected_flag();

            if let Some(reply) = state.pending_connect_reply.take() {
                let _ = reply.send(Ok(()));
            } else if is_reconnect {
                if let Some(cb) = state.broker_callbacks.clone() {
                    state.spawner.spawn(Box::pin(async move {
                        (cb.on_successfully_reconnected)();
                    }));
                }
            }
        }
        Err(err) => {
            if let Some(reply) = state.pending_connect_reply.take() {
                let _ = reply.send(Err(err));
            } else {
                give_up(state, InvoluntaryDisconnectCause::UnknownError);
            }
        }
    }
}

enum RawCause {
    Unauthorized,
    ClientWithSameIdAlreadyConnected,
    SocketError,
    Unknown,
}

fn classify_raw(raw: &serde_json::Value) -> RawCause {
    match raw.get("message").and_then(|v| v.as_str()) {
        Some("authentication failed") => RawCause::Unauthorized,
        Some("client already connected") => RawCause::ClientWithSameIdAlreadyConnected,
        None => RawCause::SocketError,
        Some(_) => RawCause::Unknown,
    }
}

/// `connect_error` (§4.H). While an initial `connect_to_broker` is still
/// pending this classifies straight into the caller's `ConnectError`;
/// afterwards (a reconnect attempt failing) it feeds the retry/give-up path.
pub fn on_connect_error(state: &mut ClientState, tx: &UnboundedSender<Event>, raw: &serde_json::Value) {
    if state.voluntary_disconnect_pending {
        return;
    }
    if let Some(reply) = state.pending_connect_reply.take() {
        state.pending_connect = None;
        let err = match classify_raw(raw) {
            RawCause::Unauthorized => ConnectError::Unauthorized,
            RawCause::ClientWithSameIdAlreadyConnected => ConnectError::ClientWithSameIdAlreadyConnected,
            RawCause::SocketError => ConnectError::SocketError,
            RawCause::Unknown => ConnectError::UnknownError,
        };
        let _ = reply.send(Err(err));
        return;
    }

    match classify_raw(raw) {
        RawCause::SocketError => schedule_retry_or_give_up(state, tx),
        RawCause::Unauthorized => give_up(state, InvoluntaryDisconnectCause::Unauthorized),
        RawCause::ClientWithSameIdAlreadyConnected => {
            give_up(state, InvoluntaryDisconnectCause::ClientWithSameIdAlreadyConnected)
        }
        RawCause::Unknown => give_up(state, InvoluntaryDisconnectCause::UnknownError),
    }
}

/// `disconnect` (no payload) while a session was previously authenticated:
/// always classified as a transport-level loss, hence always retriable
/// (subject to the usual reconnection settings).
pub async fn on_involuntary_disconnect(state: &mut ClientState, tx: &UnboundedSender<Event>) {
    if state.voluntary_disconnect_pending {
        // The facade's disconnect_from_broker drives its own latch release;
        // this path is for unrequested drops only.
        return;
    }
    schedule_retry_or_give_up(state, tx);
}

fn schedule_retry_or_give_up(state: &mut ClientState, tx: &UnboundedSender<Event>) {
    let max = state.config.max_reconnection_attempts;
    let can_retry = state.config.reconnection && max.map(|m| state.reconnect_attempts < m).unwrap_or(true);

    if !can_retry {
        let cause = if state.config.reconnection && max.is_some() {
            InvoluntaryDisconnectCause::MaxReconnectionAttemptsExceeded
        } else {
            InvoluntaryDisconnectCause::ConnectionError
        };
        give_up(state, cause);
        return;
    }

    state.reconnect_attempts += 1;
    let attempts = state.reconnect_attempts;

    // `pending_connect` already holds addr/node_id/auth if this is a retry
    // of a retry (the dial itself failed before reaching AUTHENTICATED);
    // otherwise this is the first loss after a live session and they come
    // from `broker`/`local_id`, which are about to be torn down.
    let (addr, node_id, auth) = if let Some(pending) = state.pending_connect.take() {
        (pending.addr, pending.node_id, pending.auth)
    } else {
        let Some(node_id) = state.local_id.take() else { return };
        let broker = state.broker.take();
        (
            broker.as_ref().map(|b| b.addr.clone()).unwrap_or_default(),
            node_id,
            broker.and_then(|b| b.auth),
        )
    };
    state.local_id = None;
    state.broker = None;
    state.sync_local_connected_flag();
    state.pending_connect = Some(PendingConnect { addr, node_id, auth });

    if let Some(cb) = state.broker_callbacks.clone() {
        state.spawner.spawn(Box::pin(async move {
            (cb.on_reconnection_attempt)(attempts);
        }));
    }

    let clock = state.clock.clone();
    let delta = state.config.reconnection_delta;
    let tx = tx.clone();
    state.spawner.spawn(Box::pin(async move {
        clock.sleep(delta).await;
        let _ = tx.send(Event::ReconnectTick);
    }));
}

/// Fired after `reconnection_delta` elapses following a scheduled retry.
pub async fn on_reconnect_tick(state: &mut ClientState, tx: &UnboundedSender<Event>) {
    let Some(pending) = state.pending_connect.take() else { return };
    let node_id = pending.node_id.clone();
    let auth = pending.auth.clone();
    state.pending_connect = Some(pending);
    dial(state, tx, node_id, auth).await;
}

fn give_up(state: &mut ClientState, cause: InvoluntaryDisconnectCause) {
    let callbacks = state.broker_callbacks.clone();
    state.flush();
    if let Some(cb) = callbacks {
        state.spawner.spawn(Box::pin(async move {
            (cb.on_involuntary_disconnection)(cause);
        }));
    }
}

/// Voluntary `disconnect_from_broker` (§4.H): force-closes every
/// not-yet-CONNECTED record, asks the socket to disconnect, and flushes.
pub async fn disconnect(state: &mut ClientState, _tx: &UnboundedSender<Event>, reply: oneshot::Sender<()>) {
    state.voluntary_disconnect_pending = true;

    let negotiating_initiators: Vec<NodeId> = state
        .initiators
        .iter()
        .filter(|(_, r)| r.fsm_state.is_negotiating())
        .map(|(id, _)| id.clone())
        .collect();
    for id in negotiating_initiators {
        crate::node::initiator::close_connected(state, id, crate::node::fsm::NodeState::Disconnected);
    }
    let negotiating_responders: Vec<NodeId> = state
        .responders
        .iter()
        .filter(|(_, r)| r.fsm_state.is_negotiating())
        .map(|(id, _)| id.clone())
        .collect();
    for id in negotiating_responders {
        crate::node::responder::close_connected(state, id, crate::node::fsm::NodeState::Disconnected);
    }

    state.socket.disconnect().await;
    state.flush();
    let _ = reply.send(());
}
