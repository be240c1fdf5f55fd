//! Abstract provider contracts (§4.B): the WebRTC peer-connection/data-
//! channel seam ([`rtc`]), the signaling transport seam ([`signaling`]),
//! shared wire-adjacent types ([`support`]), and the two implementations
//! that plug into them — a deterministic in-memory harness ([`testing`])
//! used throughout this crate's own test suite, and the production
//! adapters under [`native`] (feature-gated, since not every downstream
//! consumer wants to pull in `webrtc`/`tokio-tungstenite`).

pub mod rtc;
pub mod signaling;
pub mod support;
pub mod testing;

#[cfg(any(feature = "native-rtc", feature = "ws-signaling"))]
pub mod native;
