//! Signaling Protocol
//!
//! Wire messages exchanged between call clients and the relay over the
//! signaling WebSocket. One JSON object per text frame, discriminated by
//! the `event` field; signal payloads carry an inner `type` tag.

use super::CallError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound for an SDP blob inside a single envelope
pub const MAX_SDP_BYTES: usize = 32 * 1024;

/// Upper bound for a single ICE candidate line
pub const MAX_CANDIDATE_BYTES: usize = 4096;

/// Relay-issued participant identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Allocate a fresh random identifier
    pub fn generate() -> Self {
        ParticipantId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        ParticipantId(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        ParticipantId(value)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One discovered network path, in the shape browsers produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Offer, answer or trickled candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalEnvelope {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

impl SignalEnvelope {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SignalEnvelope::Offer { sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SignalEnvelope::Answer { sdp: sdp.into() }
    }

    pub fn ice_candidate(candidate: IceCandidate) -> Self {
        SignalEnvelope::IceCandidate { candidate }
    }

    /// Wire tag, used for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalEnvelope::Offer { .. } => "offer",
            SignalEnvelope::Answer { .. } => "answer",
            SignalEnvelope::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Reject empty or oversized payloads
    pub fn validate(&self) -> Result<(), CallError> {
        match self {
            SignalEnvelope::Offer { sdp } | SignalEnvelope::Answer { sdp } => {
                if sdp.trim().is_empty() {
                    return Err(CallError::Signaling(format!("Empty SDP in {}", self.kind())));
                }
                if sdp.len() > MAX_SDP_BYTES {
                    return Err(CallError::Signaling(format!(
                        "SDP in {} exceeds {} bytes",
                        self.kind(),
                        MAX_SDP_BYTES
                    )));
                }
            }
            SignalEnvelope::IceCandidate { candidate } => {
                if candidate.candidate.len() > MAX_CANDIDATE_BYTES {
                    return Err(CallError::Signaling(format!(
                        "ICE candidate exceeds {} bytes",
                        MAX_CANDIDATE_BYTES
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Messages a client sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Relay a signal to the pairing partner
    Signal {
        #[serde(flatten)]
        signal: SignalEnvelope,
    },

    /// Pair explicitly with a known participant
    Join {
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
    },

    /// Dissolve the current pairing without disconnecting
    Leave,
}

/// Messages the relay sends to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Registration acknowledgment
    Connected {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },

    /// A relayed signal
    Signal {
        from: ParticipantId,
        #[serde(flatten)]
        signal: SignalEnvelope,
    },

    /// A pairing was formed
    Paired {
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
    },

    /// The pairing partner disconnected or left
    PeerLeft {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },

    /// Rejected request
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: &str) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// Text-frame parser shared by the relay and the client
pub struct SignalingParser;

impl SignalingParser {
    /// Parse a frame received by the relay
    pub fn parse_client(text: &str, max_bytes: usize) -> Result<ClientMessage, CallError> {
        let text = Self::check_frame(text, max_bytes)?;
        let message: ClientMessage = serde_json::from_str(text)
            .map_err(|e| CallError::Signaling(format!("Invalid signaling message: {}", e)))?;
        if let ClientMessage::Signal { signal } = &message {
            signal.validate()?;
        }
        Ok(message)
    }

    /// Parse a frame received by a client
    pub fn parse_server(text: &str) -> Result<ServerMessage, CallError> {
        serde_json::from_str(text.trim())
            .map_err(|e| CallError::Signaling(format!("Invalid relay message: {}", e)))
    }

    /// Serialize any message for a text frame
    pub fn format<T: Serialize>(message: &T) -> Result<String, CallError> {
        serde_json::to_string(message)
            .map_err(|e| CallError::Signaling(format!("Failed to serialize message: {}", e)))
    }

    fn check_frame(text: &str, max_bytes: usize) -> Result<&str, CallError> {
        if text.len() > max_bytes {
            return Err(CallError::Signaling(format!(
                "Message of {} bytes exceeds limit of {}",
                text.len(),
                max_bytes
            )));
        }
        let text = text.trim();
        if !text.starts_with('{') {
            return Err(CallError::Signaling(format!(
                "Unknown message format: {}",
                text.chars().take(50).collect::<String>()
            )));
        }
        Ok(text)
    }
}
