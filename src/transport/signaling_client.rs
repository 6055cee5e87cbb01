//! Client connection to the signaling relay
//!
//! The call session only sees a pair of queues ([`SignalingChannel`]). The
//! WebSocket variant pumps those queues over tokio-tungstenite; the
//! in-memory variant is used when the relay end is driven directly.

use crate::webrtc::signaling::{ClientMessage, ServerMessage, SignalingParser};
use crate::webrtc::CallError;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Client side of a relay connection
pub struct SignalingChannel {
    /// Messages to the relay
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Messages from the relay; closes when the connection drops
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Relay side of an in-memory [`SignalingChannel`]
pub struct RelayEnd {
    pub inbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl SignalingChannel {
    pub fn in_memory() -> (SignalingChannel, RelayEnd) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        (
            SignalingChannel {
                outbound: client_tx,
                inbound: server_rx,
            },
            RelayEnd {
                inbound: client_rx,
                outbound: server_tx,
            },
        )
    }
}

/// WebSocket connector for the relay
pub struct SignalingClient;

impl SignalingClient {
    /// Connect to `url` (e.g. `ws://host:10000/signaling`) and start pumping
    /// frames. The returned task ends when either side closes.
    pub async fn connect(url: &str) -> Result<(SignalingChannel, JoinHandle<()>), CallError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| CallError::ChannelLost(format!("Failed to connect to {}: {}", url, e)))?;
        info!("Connected to signaling relay at {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        let text = match SignalingParser::format(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Dropping outbound signaling message: {}", e);
                                continue;
                            }
                        };
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => match SignalingParser::parse_server(&text) {
                            Ok(message) => {
                                if inbound_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("{}", e),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signaling connection error: {}", e);
                            break;
                        }
                    },
                }
            }
            let _ = write.close().await;
            debug!("Signaling client task finished");
        });

        Ok((
            SignalingChannel {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            task,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NegotiationConfig};
    use crate::web::{serve, SharedState};
    use crate::webrtc::media_track::{LocalTrack, TrackKind, TrackSet};
    use crate::webrtc::testing::{FakeFactory, TransportCall};
    use crate::webrtc::{CallHandle, CallSession, CallStatus, ConnectionPhase};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn start_relay() -> (String, Arc<SharedState>) {
        let state = Arc::new(SharedState::new(Config::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_state = state.clone();
        tokio::spawn(async move {
            let _ = serve(listener, server_state).await;
        });
        (format!("ws://{}/signaling", addr), state)
    }

    async fn join_call(url: &str) -> (CallHandle, FakeFactory) {
        let (channel, _task) = SignalingClient::connect(url).await.unwrap();
        let factory = FakeFactory::default();
        let tracks = TrackSet::new(vec![
            LocalTrack::new(TrackKind::Audio, Some("mic-1".into())),
            LocalTrack::new(TrackKind::Video, Some("cam-1".into())),
        ]);
        let (session, handle) = CallSession::new(factory.clone(), tracks, &NegotiationConfig::default(), channel);
        session.spawn();
        wait(&handle, |s| s.participant_id.is_some()).await;
        (handle, factory)
    }

    async fn wait<P>(handle: &CallHandle, predicate: P) -> CallStatus
    where
        P: FnMut(&CallStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for(predicate))
            .await
            .expect("timed out waiting for call status")
            .unwrap()
    }

    #[tokio::test]
    async fn two_clients_connect_through_relay() {
        let (url, state) = start_relay().await;
        let (alice, _alice_factory) = join_call(&url).await;
        let (bob, bob_factory) = join_call(&url).await;
        assert_eq!(state.registry.participant_count(), 2);

        alice.start().await.unwrap();

        let alice_status = wait(&alice, |s| s.phase == ConnectionPhase::Connected).await;
        let bob_status = wait(&bob, |s| s.phase == ConnectionPhase::Connected).await;
        assert_eq!(alice_status.peer_id, bob_status.participant_id);
        assert_eq!(bob_status.peer_id, alice_status.participant_id);
        assert_eq!(state.registry.pairing_count(), 1);
        wait(&bob, |s| s.remote_tracks == 2).await;

        // swapping alice's camera must not reach bob at all
        tokio::time::sleep(Duration::from_millis(100)).await;
        let bob_calls = bob_factory.calls().len();
        let old = alice
            .replace_track(LocalTrack::new(TrackKind::Video, Some("cam-2".into())))
            .await
            .unwrap();
        assert_eq!(old.and_then(|t| t.device_id).as_deref(), Some("cam-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bob_factory.calls().len(), bob_calls);
        assert_eq!(bob.status().phase, ConnectionPhase::Connected);
        assert_eq!(bob.status().remote_tracks, 2);

        // hanging up closes the socket; the relay tells bob
        alice.close().await;
        wait(&bob, |s| s.phase == ConnectionPhase::Closed).await;
        assert!(bob_factory.calls().contains(&TransportCall::Close));
    }

    #[tokio::test]
    async fn simultaneous_offers_resolve_to_one_call() {
        let (url, _state) = start_relay().await;
        let (alice, alice_factory) = join_call(&url).await;
        let (bob, bob_factory) = join_call(&url).await;

        let (a, b) = tokio::join!(alice.start(), bob.start());
        assert!(a.is_ok() || b.is_ok());

        let alice_status = wait(&alice, |s| s.phase == ConnectionPhase::Connected).await;
        let bob_status = wait(&bob, |s| s.phase == ConnectionPhase::Connected).await;

        let alice_id = alice_status.participant_id.unwrap();
        let bob_id = bob_status.participant_id.unwrap();
        let loser = if alice_id < bob_id { &bob_factory } else { &alice_factory };
        let winner = if alice_id < bob_id { &alice_factory } else { &bob_factory };
        assert!(!winner.calls().contains(&TransportCall::Rollback));
        if a.is_ok() && b.is_ok() {
            assert!(loser.calls().contains(&TransportCall::Rollback));
        }
    }

    #[tokio::test]
    async fn connection_to_missing_relay_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = SignalingClient::connect(&format!("ws://{}/signaling", addr)).await;
        assert!(matches!(result, Err(CallError::ChannelLost(_))));
    }
}
