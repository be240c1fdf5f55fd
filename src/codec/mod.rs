//! Wire codecs: JSON for broker signaling, CBOR for data-channel frames.

pub mod frame;
pub mod signaling;

pub use frame::{Frame, FrameCodecError, MsgType};
pub use signaling::{
    decode_signaling_message, CodecError, ConnectivityQueryRequest, ConnectivityQueryResponse,
    ConnectivityResult, Envelope, IceCandidate, SdpKind, SessionDescription, SignalingMessage,
};
