//! Small shared types used by both provider contracts: ack-token
//! classification (§6.2) and the RTC configuration payload received at
//! authenticate time (§6.6).

use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Normalized outcome of an ack-bearing socket emit.
///
/// Per §6.2: an ack response outside the enumerated OK/error token set
/// normalizes to `Error`; an absent response is also `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ok,
    Error,
}

/// Classify a raw ack payload. `value` is `None` when the emit timed out
/// or the remote peer never replied.
pub fn classify_ack(value: Option<&serde_json::Value>) -> AckOutcome {
    match value.and_then(|v| v.as_str()) {
        Some("OK") => AckOutcome::Ok,
        _ => AckOutcome::Error,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IceTransportPolicy {
    All,
    Relay,
    NoHost,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RtcpMuxPolicy {
    Require,
    Negotiate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Validated RTC configuration, as handed to a
/// [`super::rtc::PeerConnectionFactory`] on every new peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
}

#[derive(Debug, Clone, Deserialize)]
struct RtcConfigurationWire {
    #[serde(rename = "iceServers")]
    ice_servers: Option<Vec<IceServer>>,
    #[serde(rename = "iceTransportPolicy")]
    ice_transport_policy: Option<IceTransportPolicy>,
    #[serde(rename = "bundlePolicy")]
    bundle_policy: Option<BundlePolicy>,
    #[serde(rename = "rtcpMuxPolicy")]
    rtcp_mux_policy: Option<RtcpMuxPolicy>,
}

/// Parse and strictly validate the RTC configuration embedded in the
/// broker's AUTHENTICATED payload. Any missing or unrecognized field
/// yields [`ConnectError::ErrorParsingRtcConfiguration`] (§9 Open Question).
pub fn parse_rtc_configuration(raw: &serde_json::Value) -> Result<RtcConfiguration, ConnectError> {
    let wire: RtcConfigurationWire = serde_json::from_value(raw.clone())
        .map_err(|_| ConnectError::ErrorParsingRtcConfiguration)?;
    Ok(RtcConfiguration {
        ice_servers: wire.ice_servers.ok_or(ConnectError::ErrorParsingRtcConfiguration)?,
        ice_transport_policy: wire
            .ice_transport_policy
            .ok_or(ConnectError::ErrorParsingRtcConfiguration)?,
        bundle_policy: wire.bundle_policy.ok_or(ConnectError::ErrorParsingRtcConfiguration)?,
        rtcp_mux_policy: wire
            .rtcp_mux_policy
            .ok_or(ConnectError::ErrorParsingRtcConfiguration)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_ack_ok_token() {
        assert_eq!(classify_ack(Some(&serde_json::json!("OK"))), AckOutcome::Ok);
    }

    #[test]
    fn classify_ack_absent_is_error() {
        assert_eq!(classify_ack(None), AckOutcome::Error);
    }

    #[test]
    fn classify_ack_unknown_token_is_error() {
        assert_eq!(classify_ack(Some(&serde_json::json!("WHATEVER"))), AckOutcome::Error);
    }

    #[test]
    fn parses_well_formed_rtc_configuration() {
        let raw = serde_json::json!({
            "iceServers": [{"urls": ["stun:stun.example.com"]}],
            "iceTransportPolicy": "ALL",
            "bundlePolicy": "BALANCED",
            "rtcpMuxPolicy": "REQUIRE",
        });
        let cfg = parse_rtc_configuration(&raw).unwrap();
        assert_eq!(cfg.ice_servers.len(), 1);
        assert_eq!(cfg.ice_transport_policy, IceTransportPolicy::All);
    }

    #[test]
    fn rejects_missing_field() {
        let raw = serde_json::json!({ "iceServers": [] });
        assert_eq!(
            parse_rtc_configuration(&raw).unwrap_err(),
            ConnectError::ErrorParsingRtcConfiguration
        );
    }
}
