//! Abstract WebRTC provider contract (§4.B): peer-connection factory, peer
//! connection, and data channel. A production implementation lives behind
//! the `native-rtc` feature in [`super::native::rtc`]; a deterministic
//! in-memory implementation lives in [`super::testing`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::{IceCandidate, SessionDescription};
use crate::provider::support::RtcConfiguration;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("data channel error: {0}")]
    DataChannel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Callback sink for peer-connection-level events. The production adapter
/// invokes these from whatever thread the underlying engine uses; the
/// event-loop-side implementation posts an `Event` rather than touching
/// shared state directly, matching §4.A's "I/O callbacks post, never mutate"
/// rule.
pub trait PeerConnectionObserver: Send + Sync {
    fn on_ice_candidate(&self, candidate: IceCandidate);
    fn on_connection_state_change(&self, state: ConnectionState);
    fn on_data_channel(&self, channel: Arc<dyn DataChannel>);
}

/// Callback sink for data-channel-level events.
pub trait DataChannelObserver: Send + Sync {
    fn on_state_change(&self, state: DataChannelState);
    fn on_message(&self, bytes: Vec<u8>);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: RtcConfiguration,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>, ProviderError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, ProviderError>;
    async fn create_offer(&self) -> Result<SessionDescription, ProviderError>;
    async fn create_answer(&self) -> Result<SessionDescription, ProviderError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ProviderError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ProviderError>;
    fn add_ice_candidate(&self, candidate: IceCandidate);
    fn connection_state(&self) -> ConnectionState;
    fn close(&self);
}

pub trait DataChannel: Send + Sync {
    fn state(&self) -> DataChannelState;
    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>);
    fn send(&self, bytes: Vec<u8>) -> Result<(), ProviderError>;
    fn buffered_amount(&self) -> u64;
    fn close(&self);
}
