//! Client-side call negotiation
//!
//! This module provides the browser-peer side of a two-party call:
//! - SDP/ICE signaling envelopes
//! - The negotiation state machine and its candidate buffer
//! - Outbound track replacement
//! - The single-threaded call session driver

pub mod signaling;
pub mod candidates;
pub mod media_track;
pub mod peer_connection;
pub mod negotiation;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use signaling::{IceCandidate, SignalEnvelope};
pub use negotiation::{ConnectionPhase, NegotiationState};
pub use media_track::{LocalTrack, TrackKind, TrackSet};
pub use peer_connection::{MediaTransport, TransportEvent, TransportFactory, TransportState};
pub use session::{CallHandle, CallSession, CallStatus};

use std::error::Error;
use std::fmt;

/// Call-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Operation or message not acceptable in the current phase
    ProtocolViolation(String),
    /// Capture or replacement of a media device failed
    DeviceUnavailable(String),
    /// The user refused access to a capture device
    PermissionDenied(String),
    /// Transport never reached connectivity, or lost it for good
    PeerUnreachable(String),
    /// The signaling channel dropped
    ChannelLost(String),
    /// Error reported by the media transport (SDP, ICE, tracks)
    Transport(String),
    /// Malformed signaling payload
    Signaling(String),
}

impl CallError {
    /// Whether the error ends the current call attempt
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CallError::DeviceUnavailable(_) | CallError::PermissionDenied(_) | CallError::Signaling(_)
        )
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            CallError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            CallError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            CallError::PeerUnreachable(msg) => write!(f, "Peer unreachable: {}", msg),
            CallError::ChannelLost(msg) => write!(f, "Signaling channel lost: {}", msg),
            CallError::Transport(msg) => write!(f, "Transport error: {}", msg),
            CallError::Signaling(msg) => write!(f, "Signaling error: {}", msg),
        }
    }
}

impl Error for CallError {}
