//! JSON signaling envelope and message kinds, with "parsable → checked"
//! validation (§4.D): a tolerant `*Wire` type with `Option` fields is
//! deserialized first, then converted via `to_checked()` into the strict
//! [`SignalingMessage`] the rest of the crate operates on. A message
//! missing any required field is dropped with a debug log at the call
//! site — never propagated as an error to the facade caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ids::{NodeId, SessionId};

/// A field was absent from an otherwise-parsable wire message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for field `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Fields carried by every "direct message" between two Nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    #[serde(rename = "platformFrom")]
    pub platform_from: String,
    #[serde(rename = "versionFrom")]
    pub version_from: String,
    pub from: NodeId,
    pub to: NodeId,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Deserialize)]
struct EnvelopeWire {
    #[serde(rename = "platformFrom")]
    platform_from: Option<String>,
    #[serde(rename = "versionFrom")]
    version_from: Option<String>,
    from: Option<String>,
    to: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<Uuid>,
}

impl EnvelopeWire {
    fn to_checked(&self) -> Result<Envelope, CodecError> {
        Ok(Envelope {
            platform_from: self
                .platform_from
                .clone()
                .ok_or(CodecError::MissingField("platformFrom"))?,
            version_from: self
                .version_from
                .clone()
                .ok_or(CodecError::MissingField("versionFrom"))?,
            from: NodeId::from(self.from.clone().ok_or(CodecError::MissingField("from"))?),
            to: NodeId::from(self.to.clone().ok_or(CodecError::MissingField("to"))?),
            session_id: SessionId::from(
                self.session_id.ok_or(CodecError::MissingField("sessionId"))?,
            ),
        })
    }
}

/// SDP type tag, mirroring the WebRTC `RTCSdpType` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdpKind {
    Offer,
    Answer,
    PrAnswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionDescriptionWire {
    #[serde(rename = "type")]
    kind: Option<SdpKind>,
    sdp: Option<String>,
}

impl SessionDescriptionWire {
    fn to_checked(&self) -> Result<SessionDescription, CodecError> {
        Ok(SessionDescription {
            kind: self.kind.ok_or(CodecError::MissingField("sessionDescription.type"))?,
            sdp: self
                .sdp
                .clone()
                .ok_or(CodecError::MissingField("sessionDescription.sdp"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceCandidate {
    pub sdp: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: i32,
    #[serde(rename = "serverUrl", skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct IceCandidateWire {
    sdp: Option<String>,
    #[serde(rename = "sdpMid")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    sdp_m_line_index: Option<i32>,
    #[serde(rename = "serverUrl")]
    server_url: Option<String>,
}

impl IceCandidateWire {
    fn to_checked(&self) -> Result<IceCandidate, CodecError> {
        Ok(IceCandidate {
            sdp: self.sdp.clone().ok_or(CodecError::MissingField("candidate.sdp"))?,
            sdp_mid: self.sdp_mid.clone(),
            sdp_m_line_index: self
                .sdp_m_line_index
                .ok_or(CodecError::MissingField("candidate.sdpMLineIndex"))?,
            server_url: self.server_url.clone(),
        })
    }
}

/// A validated signaling message, ready for state-machine consumption.
///
/// `Serialize` is derived directly on this type since outbound messages are
/// always already-checked; only the inbound direction goes through
/// [`SignalingWire`]'s tolerant parse.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "CONNECTION_ATTEMPT")]
    ConnectionAttempt {
        #[serde(flatten)]
        envelope: Envelope,
        #[serde(rename = "sessionDescription")]
        session_description: SessionDescription,
    },
    #[serde(rename = "CONNECTION_ACCEPTANCE")]
    ConnectionAcceptance {
        #[serde(flatten)]
        envelope: Envelope,
        #[serde(rename = "sessionDescription")]
        session_description: SessionDescription,
    },
    #[serde(rename = "CONNECTION_REFUSAL")]
    ConnectionRefusal {
        #[serde(flatten)]
        envelope: Envelope,
    },
    #[serde(rename = "INCOMING_CONNECTIONS_NOT_ALLOWED")]
    IncomingConnectionsNotAllowed {
        #[serde(flatten)]
        envelope: Envelope,
    },
    #[serde(rename = "ICE_CANDIDATES_EXCHANGE_I_TO_R")]
    IceCandidateItoR {
        #[serde(flatten)]
        envelope: Envelope,
        candidate: IceCandidate,
    },
    #[serde(rename = "ICE_CANDIDATES_EXCHANGE_R_TO_I")]
    IceCandidateRtoI {
        #[serde(flatten)]
        envelope: Envelope,
        candidate: IceCandidate,
    },
    #[serde(rename = "SOCKET_MSG_EXCHANGE")]
    SocketMsgExchange {
        from: NodeId,
        to: NodeId,
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
}

impl SignalingMessage {
    /// The session id this message carries, if any. `SocketMsgExchange`
    /// carries none — per §6.1 it requires no platform/version/session_id.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::ConnectionAttempt { envelope, .. }
            | Self::ConnectionAcceptance { envelope, .. }
            | Self::ConnectionRefusal { envelope }
            | Self::IncomingConnectionsNotAllowed { envelope }
            | Self::IceCandidateItoR { envelope, .. }
            | Self::IceCandidateRtoI { envelope, .. } => Some(envelope.session_id),
            Self::SocketMsgExchange { .. } => None,
        }
    }

    pub fn from_id(&self) -> &NodeId {
        match self {
            Self::ConnectionAttempt { envelope, .. }
            | Self::ConnectionAcceptance { envelope, .. }
            | Self::ConnectionRefusal { envelope }
            | Self::IncomingConnectionsNotAllowed { envelope }
            | Self::IceCandidateItoR { envelope, .. }
            | Self::IceCandidateRtoI { envelope, .. } => &envelope.from,
            Self::SocketMsgExchange { from, .. } => from,
        }
    }
}

/// Tolerant deserialization target for inbound signaling messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum SignalingWire {
    #[serde(rename = "CONNECTION_ATTEMPT")]
    ConnectionAttempt {
        #[serde(flatten)]
        envelope: EnvelopeWire,
        #[serde(rename = "sessionDescription")]
        session_description: Option<SessionDescriptionWire>,
    },
    #[serde(rename = "CONNECTION_ACCEPTANCE")]
    ConnectionAcceptance {
        #[serde(flatten)]
        envelope: EnvelopeWire,
        #[serde(rename = "sessionDescription")]
        session_description: Option<SessionDescriptionWire>,
    },
    #[serde(rename = "CONNECTION_REFUSAL")]
    ConnectionRefusal {
        #[serde(flatten)]
        envelope: EnvelopeWire,
    },
    #[serde(rename = "INCOMING_CONNECTIONS_NOT_ALLOWED")]
    IncomingConnectionsNotAllowed {
        #[serde(flatten)]
        envelope: EnvelopeWire,
    },
    #[serde(rename = "ICE_CANDIDATES_EXCHANGE_I_TO_R")]
    IceCandidateItoR {
        #[serde(flatten)]
        envelope: EnvelopeWire,
        candidate: Option<IceCandidateWire>,
    },
    #[serde(rename = "ICE_CANDIDATES_EXCHANGE_R_TO_I")]
    IceCandidateRtoI {
        #[serde(flatten)]
        envelope: EnvelopeWire,
        candidate: Option<IceCandidateWire>,
    },
    #[serde(rename = "SOCKET_MSG_EXCHANGE")]
    SocketMsgExchange {
        from: Option<String>,
        to: Option<String>,
        channel: Option<String>,
        msg: Option<String>,
    },
}

impl SignalingWire {
    fn to_checked(&self) -> Result<SignalingMessage, CodecError> {
        Ok(match self {
            Self::ConnectionAttempt {
                envelope,
                session_description,
            } => SignalingMessage::ConnectionAttempt {
                envelope: envelope.to_checked()?,
                session_description: session_description
                    .as_ref()
                    .ok_or(CodecError::MissingField("sessionDescription"))?
                    .to_checked()?,
            },
            Self::ConnectionAcceptance {
                envelope,
                session_description,
            } => SignalingMessage::ConnectionAcceptance {
                envelope: envelope.to_checked()?,
                session_description: session_description
                    .as_ref()
                    .ok_or(CodecError::MissingField("sessionDescription"))?
                    .to_checked()?,
            },
            Self::ConnectionRefusal { envelope } => SignalingMessage::ConnectionRefusal {
                envelope: envelope.to_checked()?,
            },
            Self::IncomingConnectionsNotAllowed { envelope } => {
                SignalingMessage::IncomingConnectionsNotAllowed {
                    envelope: envelope.to_checked()?,
                }
            }
            Self::IceCandidateItoR { envelope, candidate } => SignalingMessage::IceCandidateItoR {
                envelope: envelope.to_checked()?,
                candidate: candidate
                    .as_ref()
                    .ok_or(CodecError::MissingField("candidate"))?
                    .to_checked()?,
            },
            Self::IceCandidateRtoI { envelope, candidate } => SignalingMessage::IceCandidateRtoI {
                envelope: envelope.to_checked()?,
                candidate: candidate
                    .as_ref()
                    .ok_or(CodecError::MissingField("candidate"))?
                    .to_checked()?,
            },
            Self::SocketMsgExchange {
                from,
                to,
                channel,
                msg,
            } => SignalingMessage::SocketMsgExchange {
                from: NodeId::from(from.clone().ok_or(CodecError::MissingField("from"))?),
                to: NodeId::from(to.clone().ok_or(CodecError::MissingField("to"))?),
                channel: channel.clone().ok_or(CodecError::MissingField("channel"))?,
                msg: msg.clone(),
            },
        })
    }
}

/// Parse and validate a signaling message from its raw JSON wire form.
/// Unknown top-level keys are tolerated automatically by serde; a message
/// missing a required field (or whose `type` tag is unrecognized) is
/// rejected with [`CodecError`].
pub fn decode_signaling_message(raw: &[u8]) -> Result<SignalingMessage, CodecError> {
    let wire: SignalingWire = serde_json::from_slice(raw)
        .map_err(|e| CodecError::InvalidValue { field: "type", reason: e.to_string() })?;
    wire.to_checked()
}

/// A connectivity query sent to the broker (`ARE_NODES_CONNECTED_TO_BROKER`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityQueryRequest {
    pub ids: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityResult {
    pub id: NodeId,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityQueryResponse {
    pub results: Vec<ConnectivityResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            platform_from: "rust".into(),
            version_from: "0.1.0".into(),
            from: NodeId::from("alice"),
            to: NodeId::from("bob"),
            session_id: SessionId::generate(),
        }
    }

    #[test]
    fn connection_attempt_round_trips() {
        let msg = SignalingMessage::ConnectionAttempt {
            envelope: envelope(),
            session_description: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let decoded = decode_signaling_message(&json).unwrap();
        assert_eq!(decoded.from_id().as_str(), "alice");
        assert!(decoded.session_id().is_some());
    }

    #[test]
    fn missing_envelope_field_is_rejected() {
        let json = br#"{"type":"CONNECTION_REFUSAL","platformFrom":"rust","from":"a","to":"b","sessionId":"9d4e3f1a-0000-4000-8000-000000000000"}"#;
        let err = decode_signaling_message(json).unwrap_err();
        assert_eq!(err, CodecError::MissingField("versionFrom"));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let json = br#"{"type":"CONNECTION_REFUSAL","platformFrom":"rust","versionFrom":"1","from":"a","to":"b","sessionId":"9d4e3f1a-0000-4000-8000-000000000000","somethingElse":123}"#;
        assert!(decode_signaling_message(json).is_ok());
    }

    #[test]
    fn socket_msg_exchange_requires_no_envelope() {
        let json = br#"{"type":"SOCKET_MSG_EXCHANGE","from":"a","to":"b","channel":"chat","msg":"hi"}"#;
        let decoded = decode_signaling_message(json).unwrap();
        assert!(decoded.session_id().is_none());
    }

    #[test]
    fn connectivity_query_round_trips() {
        let req = ConnectivityQueryRequest {
            ids: vec![NodeId::from("a"), NodeId::from("b")],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ConnectivityQueryRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ids.len(), 2);
    }
}
