//! Transport layer for callbridge
//!
//! Relay-side WebSocket handling and the client connection to the relay.

pub mod signaling_server;
pub mod signaling_client;

pub use signaling_server::handle_signaling_connection;
pub use signaling_client::{RelayEnd, SignalingChannel, SignalingClient};
