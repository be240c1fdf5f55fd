//! Production provider adapters. [`rtc`] wraps the `webrtc` crate behind
//! the `native-rtc` feature; [`signaling`] wraps `tokio-tungstenite` behind
//! `ws-signaling`. Neither module is compiled unless its feature is on.

#[cfg(feature = "native-rtc")]
pub mod rtc;

#[cfg(feature = "ws-signaling")]
pub mod signaling;
