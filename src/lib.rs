//! callbridge - two-party WebRTC call signaling
//!
//! A relay that pairs two participants and forwards their offer/answer/ICE
//! messages, plus the client-side negotiation state machine that drives a
//! peer connection through a call.

pub mod config;
pub mod registry;
pub mod transport;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use registry::{RelayPolicy, SessionRegistry};
pub use transport::{SignalingChannel, SignalingClient};
pub use webrtc::{CallError, CallHandle, CallSession, ConnectionPhase};
