//! # p2p-node-core
//!
//! A peer-to-peer connection client built around a rendezvous **Broker**
//! for WebRTC signaling and a framed, reassembled data-channel transport.
//! A [`Node`] authenticates against a broker over a signaling socket,
//! negotiates direct WebRTC connections with other nodes (as either the
//! initiating or the accepting side), and exchanges length-prefixed,
//! multipart-capable messages over the resulting data channels once
//! negotiation completes.
//!
//! ## Module Hierarchy
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         EVENT LOOP (event_loop)                     │
//! │   single task owning `state::ClientState`, driven by one mpsc       │
//! │   channel of `Event`s — broker lifecycle, provider callbacks, and   │
//! │   every facade command funnel through here                         │
//! ├──────────────────┬──────────────────┬───────────────┬──────────────┤
//! │  broker           │  node             │  provider     │  codec       │
//! │  - lifecycle      │  - record (fsm)   │  - rtc        │  - frame     │
//! │  - router         │  - initiator      │  - signaling  │  - signaling │
//! │                    │  - responder      │  - support    │              │
//! │                    │  - fsm            │  - testing    │              │
//! │                    │                   │  - native     │              │
//! └──────────────────┴──────────────────┴───────────────┴──────────────┘
//! ```
//!
//! - [`facade`] — the public [`Node`]/[`NodeBuilder`] handle; every call
//!   into the crate goes through it.
//! - [`event_loop`] — the single task that owns [`state::ClientState`] and
//!   drives every state transition from one `Event` enum.
//! - [`broker`] — broker connect/reconnect lifecycle and the inbound
//!   signaling message router.
//! - [`node`] — per-remote connection state machine, split into the
//!   initiator and responder roles.
//! - [`provider`] — the abstract WebRTC and signaling-socket contracts,
//!   with an in-memory test harness and feature-gated production adapters.
//! - [`codec`] — the JSON signaling envelope and the CBOR data-channel
//!   frame format, plus multipart [`framing`].
//! - [`connect_attempt`] — aggregates a `connect_to_multiple` batch's
//!   per-target outcomes into one conclusion.
//! - [`config`], [`error`], [`ids`], [`clock`] — ambient configuration,
//!   per-operation error enums, newtype identifiers, and the time/spawn
//!   abstraction the event loop runs against.
//!
//! ## Testing without a real broker or WebRTC stack
//!
//! [`provider::testing`] implements both provider contracts in-process,
//! so the whole negotiation and messaging lifecycle — broker auth,
//! offer/answer exchange, ICE, data channel open, framed delivery,
//! reconnection — is exercised in `#[tokio::test]`s without a network or
//! a real WebRTC engine. Production callers build a [`Node`] against
//! [`provider::native`] instead (behind the `native-rtc`/`ws-signaling`
//! features).

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod broker;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connect_attempt;
pub mod error;
pub mod event_loop;
pub mod facade;
pub mod framing;
pub mod ids;
pub mod node;
pub mod provider;
pub mod state;

pub use config::{NodeBuilder as NodeConfigBuilder, NodeConfig};
pub use error::{
    ConnectError, IncomingToggleError, InvoluntaryDisconnectCause, P2pConnectError,
    RemoteConnectivityError, SendError,
};
pub use facade::{BrokerConnectParams, Node, NodeBuilder};
pub use ids::{NodeId, SessionId};

/// Returns the version of this crate, as set in `Cargo.toml`.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_nonempty() {
        assert!(!version().is_empty());
    }
}
