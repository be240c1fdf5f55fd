//! Production [`PeerConnectionFactory`]/[`PeerConnection`]/[`DataChannel`]
//! built on the `webrtc` crate (feature `native-rtc`). Every `on_*`
//! registration is a thin bridge from webrtc-rs's async callback style into
//! the observer traits' plain synchronous methods — the observer itself
//! only ever posts an `Event`, never blocks, so there is nothing to await.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::codec::{IceCandidate, SdpKind, SessionDescription};
use crate::provider::rtc::{
    ConnectionState, DataChannel, DataChannelObserver, DataChannelState, PeerConnection,
    PeerConnectionFactory, PeerConnectionObserver, ProviderError,
};
use crate::provider::support::RtcConfiguration as CoreRtcConfiguration;

fn to_webrtc_configuration(config: &CoreRtcConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.password.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn to_core_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => ConnectionState::New,
    }
}

fn to_core_data_channel_state(state: RTCDataChannelState) -> DataChannelState {
    match state {
        RTCDataChannelState::Connecting => DataChannelState::Connecting,
        RTCDataChannelState::Open => DataChannelState::Open,
        RTCDataChannelState::Closing => DataChannelState::Closing,
        RTCDataChannelState::Closed => DataChannelState::Closed,
        RTCDataChannelState::Unspecified => DataChannelState::Connecting,
    }
}

fn to_webrtc_sdp(desc: SessionDescription) -> Result<RTCSessionDescription, ProviderError> {
    let sdp_type = match desc.kind {
        SdpKind::Offer => RTCSdpType::Offer,
        SdpKind::Answer => RTCSdpType::Answer,
        SdpKind::PrAnswer => RTCSdpType::Pranswer,
        SdpKind::Rollback => RTCSdpType::Rollback,
    };
    match sdp_type {
        RTCSdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        RTCSdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        _ => RTCSessionDescription::offer(desc.sdp),
    }
    .map_err(|e| ProviderError::PeerConnection(e.to_string()))
}

fn from_webrtc_sdp(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::PrAnswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => SdpKind::Offer,
    };
    SessionDescription { kind, sdp: desc.sdp }
}

fn to_webrtc_ice_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.sdp,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: Some(candidate.sdp_m_line_index as u16),
        username_fragment: None,
    }
}

fn from_webrtc_ice_candidate(candidate: RTCIceCandidate) -> Option<IceCandidate> {
    let init = candidate.to_json().ok()?;
    Some(IceCandidate {
        sdp: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index.unwrap_or_default() as i32,
        server_url: None,
    })
}

/// Builds [`NativePeerConnection`]s against a fresh `webrtc::api::API` per
/// connection, matching the teacher's pattern of constructing transport
/// objects on demand rather than sharing one engine instance across peers.
pub struct NativePeerConnectionFactory;

impl NativePeerConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativePeerConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionFactory for NativePeerConnectionFactory {
    async fn create(
        &self,
        config: CoreRtcConfiguration,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>, ProviderError> {
        let media_engine = MediaEngine::default();
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let inner = api
            .new_peer_connection(to_webrtc_configuration(&config))
            .await
            .map_err(|e| ProviderError::PeerConnection(e.to_string()))?;
        let inner = Arc::new(inner);

        {
            let observer = observer.clone();
            inner.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate.and_then(from_webrtc_ice_candidate) {
                    observer.on_ice_candidate(candidate);
                }
                Box::pin(async {})
            }));
        }
        {
            let observer = observer.clone();
            inner.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                observer.on_connection_state_change(to_core_connection_state(state));
                Box::pin(async {})
            }));
        }
        {
            let observer = observer.clone();
            inner.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let wrapped: Arc<dyn DataChannel> = Arc::new(NativeDataChannel::new(dc));
                observer.on_data_channel(wrapped);
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(NativePeerConnection { inner }))
    }
}

pub struct NativePeerConnection {
    inner: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for NativePeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, ProviderError> {
        let inner = self.inner.clone();
        let label = label.to_string();
        let dc = futures::executor::block_on(inner.create_data_channel(&label, None))
            .map_err(|e| ProviderError::DataChannel(e.to_string()))?;
        Ok(Arc::new(NativeDataChannel::new(dc)))
    }

    async fn create_offer(&self) -> Result<SessionDescription, ProviderError> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(|e| ProviderError::PeerConnection(e.to_string()))?;
        Ok(from_webrtc_sdp(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        let answer = self
            .inner
            .create_answer(None)
            .await
            .map_err(|e| ProviderError::PeerConnection(e.to_string()))?;
        Ok(from_webrtc_sdp(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ProviderError> {
        let desc = to_webrtc_sdp(desc)?;
        self.inner
            .set_local_description(desc)
            .await
            .map_err(|e| ProviderError::PeerConnection(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ProviderError> {
        let desc = to_webrtc_sdp(desc)?;
        self.inner
            .set_remote_description(desc)
            .await
            .map_err(|e| ProviderError::PeerConnection(e.to_string()))
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        let inner = self.inner.clone();
        let init = to_webrtc_ice_candidate(candidate);
        tokio::spawn(async move {
            if let Err(err) = inner.add_ice_candidate(init).await {
                tracing::debug!(%err, "add_ice_candidate failed");
            }
        });
    }

    fn connection_state(&self) -> ConnectionState {
        to_core_connection_state(self.inner.connection_state())
    }

    fn close(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = inner.close().await;
        });
    }
}

pub struct NativeDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl NativeDataChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self { inner }
    }
}

impl DataChannel for NativeDataChannel {
    fn state(&self) -> DataChannelState {
        to_core_data_channel_state(self.inner.ready_state())
    }

    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>) {
        {
            let observer = observer.clone();
            self.inner.on_open(Box::new(move || {
                observer.on_state_change(DataChannelState::Open);
                Box::pin(async {})
            }));
        }
        {
            let observer = observer.clone();
            self.inner.on_close(Box::new(move || {
                observer.on_state_change(DataChannelState::Closed);
                Box::pin(async {})
            }));
        }
        {
            self.inner.on_message(Box::new(move |msg| {
                observer.on_message(msg.data.to_vec());
                Box::pin(async {})
            }));
        }
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), ProviderError> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.send(&bytes::Bytes::from(bytes)).await {
                tracing::debug!(%err, "data channel send failed");
            }
        });
        Ok(())
    }

    fn buffered_amount(&self) -> u64 {
        futures::executor::block_on(self.inner.buffered_amount()) as u64
    }

    fn close(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = inner.close().await;
        });
    }
}
