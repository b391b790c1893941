//! Signaling wire messages
//!
//! JSON payloads exchanged with the signaling endpoint. The HTTP variant
//! carries a single offer or answer per request; the WebSocket variant
//! additionally trickles ICE candidates.

use super::RelayError;
use serde::{Deserialize, Serialize};

/// Signaling message types, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP offer from the publisher
    Offer { sdp: String },

    /// SDP answer from this receiver
    Answer { sdp: String },

    /// Trickled ICE candidate; `null` marks end of gathering
    Candidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },

    /// Anything else the relay forwards (`receiver_connected`, ...)
    #[serde(other)]
    Unknown,
}

/// Publisher offer. Identified by SDP content alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub sdp: String,
}

/// Local answer posted back to the publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub sdp: String,
}

/// ICE candidate in browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl Offer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }

    /// Whether this offer was already consumed
    pub fn matches(&self, sdp: Option<&str>) -> bool {
        sdp == Some(self.sdp.as_str())
    }
}

impl Answer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

impl From<Answer> for SignalingMessage {
    fn from(answer: Answer) -> Self {
        SignalingMessage::Answer { sdp: answer.sdp }
    }
}

impl SignalingMessage {
    /// Parse a signaling message from JSON
    pub fn from_json(json: &str) -> Result<Self, RelayError> {
        serde_json::from_str(json.trim())
            .map_err(|e| RelayError::Signaling(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Signaling(format!("Failed to serialize message: {}", e)))
    }

    /// Create a candidate message
    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::Candidate { candidate: Some(candidate) }
    }

    /// Extract the offer, rejecting every other message type
    pub fn into_offer(self) -> Result<Offer, RelayError> {
        match self {
            SignalingMessage::Offer { sdp } if !sdp.trim().is_empty() => Ok(Offer { sdp }),
            SignalingMessage::Offer { .. } => Err(RelayError::Sdp("Offer carries an empty SDP".to_string())),
            other => Err(RelayError::Signaling(format!("Expected offer, got {}", other.kind()))),
        }
    }

    /// Message type as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Unknown => "unknown",
        }
    }
}
