//! Broker message router (§4.I): registers per-event handlers on the
//! socket and dispatches already-decoded [`SignalingMessage`]s to the
//! per-pair state machine (§4.F) or the direct-relay callbacks.

use tokio::sync::mpsc::UnboundedSender;

use crate::codec::signaling::SignalingMessage;
use crate::codec::decode_signaling_message;
use crate::error::P2pConnectError;
use crate::event_loop::Event;
use crate::ids::{NodeId, SessionId};
use crate::state::ClientState;

const SIGNALING_EVENT_NAMES: &[&str] = &[
    "CONNECTION_ATTEMPT",
    "CONNECTION_ACCEPTANCE",
    "CONNECTION_REFUSAL",
    "INCOMING_CONNECTIONS_NOT_ALLOWED",
    "ICE_CANDIDATES_EXCHANGE_I_TO_R",
    "ICE_CANDIDATES_EXCHANGE_R_TO_I",
    "SOCKET_MSG_EXCHANGE",
];

/// Register the broker lifecycle and signaling handlers on `state`'s
/// socket, each converting a raw payload into an `Event` posted to `tx`.
/// Called once, before the event loop starts draining its channel.
pub fn install(state: &ClientState, tx: UnboundedSender<Event>) {
    let socket = state.socket.clone();

    let authenticated_tx = tx.clone();
    socket.on(
        "AUTHENTICATED",
        Box::new(move |payload| {
            let _ = authenticated_tx.send(Event::SocketAuthenticated { rtc_config_json: payload });
        }),
    );

    let connect_error_tx = tx.clone();
    socket.on(
        "connect_error",
        Box::new(move |payload| {
            let _ = connect_error_tx.send(Event::SocketConnectError { raw: payload });
        }),
    );

    let disconnect_tx = tx.clone();
    socket.on(
        "disconnect",
        Box::new(move |_payload| {
            let _ = disconnect_tx.send(Event::SocketDisconnected);
        }),
    );

    for event_name in SIGNALING_EVENT_NAMES.iter().copied() {
        let signaling_tx = tx.clone();
        socket.on(
            event_name,
            Box::new(move |payload| {
                let decoded = serde_json::to_vec(&payload)
                    .ok()
                    .and_then(|bytes| decode_signaling_message(&bytes).ok());
                match decoded {
                    Some(msg) => {
                        let _ = signaling_tx.send(Event::SocketSignaling(msg));
                    }
                    None => tracing::debug!("dropping malformed {} payload", event_name),
                }
            }),
        );
    }
}

fn session_matches_initiator(state: &ClientState, from: &NodeId, session_id: SessionId) -> bool {
    state
        .initiators
        .get(from)
        .is_some_and(|r| r.session_id == session_id)
}

fn session_matches_responder(state: &ClientState, from: &NodeId, session_id: SessionId) -> bool {
    state
        .responders
        .get(from)
        .is_some_and(|r| r.session_id == session_id)
}

/// Dispatch one already-validated inbound [`SignalingMessage`] (§4.D: the
/// envelope has already passed `to_checked()`; the session-id check
/// against the resident node happens here, per-variant).
pub async fn route(state: &mut ClientState, tx: &UnboundedSender<Event>, msg: SignalingMessage) {
    match msg {
        SignalingMessage::ConnectionAttempt {
            envelope,
            session_description,
        } => {
            crate::node::responder::handle_connection_attempt(
                state,
                tx,
                envelope.from,
                envelope.platform_from,
                envelope.version_from,
                envelope.session_id,
                session_description,
            )
            .await;
        }
        SignalingMessage::ConnectionAcceptance {
            envelope,
            session_description,
        } => {
            if session_matches_initiator(state, &envelope.from, envelope.session_id) {
                crate::node::initiator::on_connection_acceptance(state, tx, envelope.from, session_description).await;
            } else {
                tracing::debug!(from = %envelope.from, "dropping CONNECTION_ACCEPTANCE: no matching session");
            }
        }
        SignalingMessage::ConnectionRefusal { envelope } => {
            if session_matches_initiator(state, &envelope.from, envelope.session_id) {
                crate::node::initiator::on_remote_refused(
                    state,
                    envelope.from,
                    P2pConnectError::ConnectionRefusedByRemoteNode,
                );
            }
        }
        SignalingMessage::IncomingConnectionsNotAllowed { envelope } => {
            if session_matches_initiator(state, &envelope.from, envelope.session_id) {
                crate::node::initiator::on_remote_refused(
                    state,
                    envelope.from,
                    P2pConnectError::ConnectionsNotAllowedOnRemoteNode,
                );
            }
        }
        SignalingMessage::IceCandidateItoR { envelope, candidate } => {
            if session_matches_responder(state, &envelope.from, envelope.session_id) {
                crate::node::responder::on_remote_ice_candidate(state, envelope.from, candidate);
            }
        }
        SignalingMessage::IceCandidateRtoI { envelope, candidate } => {
            if session_matches_initiator(state, &envelope.from, envelope.session_id) {
                crate::node::initiator::on_remote_ice_candidate(state, envelope.from, candidate);
            }
        }
        SignalingMessage::SocketMsgExchange { from, channel, msg, .. } => {
            if let Some(cb) = state.direct_msg_callbacks.get(&channel).cloned() {
                state.spawner.spawn(Box::pin(async move {
                    cb(&from, msg.as_deref().unwrap_or(""));
                }));
            }
        }
    }
}
