//! Typed error hierarchy for the public facade.
//!
//! ## Error Hierarchy
//!
//! Each facade operation (`facade::Node`) returns a closed, small error enum
//! specific to that operation rather than one umbrella type — the domains in
//! the table below never overlap in practice, and callers that only care
//! about, say, `P2pConnectError` shouldn't have to match on
//! `ConnectError` variants that can never occur there.
//!
//! | Domain | Type |
//! |---|---|
//! | Broker connect | [`ConnectError`] |
//! | Broker involuntary disconnect | [`InvoluntaryDisconnectCause`] |
//! | Remote connectivity check | [`RemoteConnectivityError`] |
//! | Send via broker relay | [`SendError`] |
//! | P2P connect | [`P2pConnectError`] |
//! | Incoming toggle | [`IncomingToggleError`] |
//!
//! Internal faults (parse errors, unexpected acks, provider callback
//! failures) never reach this boundary: they're logged at debug and
//! re-expressed as state transitions (see [`CoreError`]).

use thiserror::Error;

/// Failure classification for [`crate::facade::Node::connect_to_broker`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The broker's auth handshake rejected our credentials.
    #[error("broker rejected authentication")]
    Unauthorized,
    /// Another client is already connected to the broker under this id.
    #[error("a client with the same id is already connected to the broker")]
    ClientWithSameIdAlreadyConnected,
    /// Transport-level failure (refused, reset, timed out) while connecting.
    #[error("socket error while connecting to the broker")]
    SocketError,
    /// The AUTHENTICATED payload's RTC configuration didn't parse/validate.
    #[error("failed to parse the RTC configuration returned by the broker")]
    ErrorParsingRtcConfiguration,
    /// `connect_to_broker` was called while already connected.
    #[error("this local client is already connected to a broker")]
    LocalClientAlreadyConnected,
    /// The requested transport/provider stack isn't available on this build.
    #[error("unsupported architecture for the requested provider stack")]
    UnsupportedArchitecture,
    /// Anything the classifier couldn't place in the above buckets.
    #[error("unknown error connecting to the broker")]
    UnknownError,
}

/// Why the broker connection was lost without the user asking for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvoluntaryDisconnectCause {
    #[error("reconnection attempts exhausted")]
    MaxReconnectionAttemptsExceeded,
    #[error("broker rejected authentication on reconnect")]
    Unauthorized,
    #[error("a client with the same id is already connected to the broker")]
    ClientWithSameIdAlreadyConnected,
    #[error("connection to the broker was lost")]
    ConnectionError,
    #[error("unknown disconnection cause")]
    UnknownError,
}

/// Failure modes of [`crate::facade::Node::are_remotes_connected`] /
/// `is_remote_connected`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteConnectivityError {
    #[error("not connected to the broker")]
    NotConnectedToBroker,
    #[error("unknown error querying remote connectivity")]
    UnknownError,
}

/// Failure modes of [`crate::facade::Node::send_socket_msg`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("not connected to the broker")]
    NotConnectedToBroker,
    #[error("channel name must not be empty")]
    EmptyChannel,
    #[error("remote id must not be empty")]
    EmptyId,
    #[error("cannot send a message to the local node's own id")]
    TriedToSendMsgToSelf,
    #[error("broker returned an error for this send")]
    Error,
}

/// Failure modes of a P2P connection attempt (per-target, §4.G).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum P2pConnectError {
    #[error("local node is not connected to the broker")]
    LocalNodeNotConnectedToBroker,
    #[error("cannot connect to the local node's own id")]
    TriedToConnectToSelf,
    #[error("already connected (or connecting) to this remote node")]
    AlreadyConnectedToRemoteNode,
    #[error("connection attempt was closed by the user before it concluded")]
    ConnectionAttemptClosedByUserForcefully,
    #[error("connection timed out before reaching CONNECTED")]
    ConnectionTimeout,
    #[error("remote node is not connected to the broker")]
    RemoteNodeNotConnectedToBroker,
    #[error("signaling negotiation failed")]
    ConnectionNegotiationError,
    #[error("remote node refused the connection")]
    ConnectionRefusedByRemoteNode,
    #[error("remote node does not allow incoming connections")]
    ConnectionsNotAllowedOnRemoteNode,
}

/// Failure modes of [`crate::facade::Node::allow_incoming`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IncomingToggleError {
    #[error("not connected to the broker")]
    NotConnectedToBroker,
    #[error("incoming connections are already allowed")]
    IncomingConnectionsAlreadyAllowed,
}

/// Internal-only faults: parse errors, unexpected acks, provider callback
/// failures. Never returned to a facade caller — logged at debug and
/// converted into a state transition (a node goes to `NEGOTIATION_ERROR`,
/// a malformed signaling message is dropped, etc).
#[derive(Debug, Error)]
pub(crate) enum CoreError {
    #[error("malformed signaling message: {0}")]
    MalformedSignalingMessage(String),
    #[error("unexpected broker ack: {0}")]
    UnexpectedAck(String),
    #[error("provider callback failed: {0}")]
    ProviderFailure(String),
}
