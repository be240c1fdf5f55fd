//! Production [`SignalingSocket`] built on `tokio-tungstenite` (feature
//! `ws-signaling`).
//!
//! The wire protocol is a small event/ack envelope on top of plain JSON
//! text frames — `{"event", "payload", "ackId"?}` outbound, with the
//! broker echoing `{"ackId", "payload"}` for anything that carries one.
//! Unsolicited pushes (`AUTHENTICATED`, `connect_error`, the signaling
//! events `broker::router` installs handlers for) arrive as the same
//! envelope without an `ackId` and are dispatched to whatever handler
//! `on()` last registered for that event name — mirroring
//! [`super::super::testing::InMemorySocket`]'s contract so the router and
//! lifecycle code are wholly unaware of which implementation they're
//! driving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

use crate::provider::signaling::{ConnectQuery, EventHandler, SignalingSocket, SocketError};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    event: &'a str,
    payload: serde_json::Value,
    #[serde(rename = "ackId", skip_serializing_if = "Option::is_none")]
    ack_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    event: Option<String>,
    payload: serde_json::Value,
    #[serde(rename = "ackId")]
    ack_id: Option<u64>,
}

struct Inner {
    sink: Mutex<Option<WsSink>>,
    handlers: Mutex<HashMap<String, Arc<dyn Fn(serde_json::Value) + Send + Sync>>>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    next_ack_id: AtomicU64,
    connected: AtomicBool,
}

/// Connects to a broker over `wss://`/`ws://` and speaks the event/ack
/// envelope described above.
pub struct WsSignalingSocket {
    url: String,
    inner: Arc<Inner>,
}

impl WsSignalingSocket {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: Arc::new(Inner {
                sink: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                next_ack_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
            }),
        }
    }

    fn spawn_reader(inner: Arc<Inner>, mut reader: futures_util::stream::SplitStream<WsStream>) {
        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let Ok(envelope) = serde_json::from_str::<InboundEnvelope>(&text) else {
                    tracing::debug!("dropping malformed signaling frame");
                    continue;
                };
                if let Some(ack_id) = envelope.ack_id {
                    if let Some(tx) = inner.pending_acks.lock().remove(&ack_id) {
                        let _ = tx.send(envelope.payload);
                    }
                    continue;
                }
                let Some(event) = envelope.event else {
                    continue;
                };
                let handler = inner.handlers.lock().get(&event).cloned();
                if let Some(handler) = handler {
                    handler(envelope.payload);
                }
            }
            inner.connected.store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl SignalingSocket for WsSignalingSocket {
    async fn connect(&self, query: ConnectQuery) -> Result<(), SocketError> {
        let url = url::Url::parse_with_params(
            &self.url,
            &[
                ("id", query.id.as_str()),
                ("version", query.version.as_str()),
                ("runtime", query.runtime.as_str()),
            ],
        )
        .map_err(|e| SocketError::Transport(e.to_string()))?;

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SocketError::Transport(e.to_string()))?;
        let (sink, reader) = stream.split();

        *self.inner.sink.lock() = Some(sink);
        self.inner.connected.store(true, Ordering::SeqCst);
        Self::spawn_reader(self.inner.clone(), reader);

        if let Some(data) = query.data {
            let _ = self.emit("AUTHENTICATE", data).await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.sink.lock().take() {
            let _ = sink.close().await;
        }
    }

    async fn emit(&self, event_name: &str, payload: serde_json::Value) -> Option<serde_json::Value> {
        let ack_id = self.inner.next_ack_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_acks.lock().insert(ack_id, tx);

        let envelope = OutboundEnvelope {
            event: event_name,
            payload,
            ack_id: Some(ack_id),
        };
        let text = serde_json::to_string(&envelope).ok()?;

        let mut sink = self.inner.sink.lock().take()?;
        let sent = sink.send(Message::Text(text)).await;
        *self.inner.sink.lock() = Some(sink);
        if sent.is_err() {
            self.inner.pending_acks.lock().remove(&ack_id);
            return None;
        }

        rx.await.ok()
    }

    fn on(&self, event_name: &str, handler: EventHandler) {
        self.inner.handlers.lock().insert(event_name.to_string(), Arc::from(handler));
    }

    fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
