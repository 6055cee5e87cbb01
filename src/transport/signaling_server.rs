//! Signaling relay endpoint
//!
//! One task per WebSocket. A writer task drains the participant's outbox
//! and pings on an interval; the reader loop parses frames and hands them to
//! the [`SessionRegistry`](crate::registry::SessionRegistry).

use crate::registry::RelayOutcome;
use crate::web::SharedState;
use crate::webrtc::signaling::{ClientMessage, ParticipantId, ServerMessage, SignalingParser};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handle a signaling WebSocket connection for its whole lifetime
pub async fn handle_signaling_connection(socket: WebSocket, state: Arc<SharedState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let participant_id = match state.registry.register(tx.clone()) {
        Ok(id) => id,
        Err(e) => {
            warn!("Refusing signaling connection: {}", e);
            let refusal = ServerMessage::error("RELAY_FULL", &e.to_string());
            if let Ok(text) = SignalingParser::format(&refusal) {
                let _ = ws_sender.send(Message::Text(text.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    info!("Signaling connection established for {}", participant_id);

    let config = &state.config.signaling;
    let ping_interval = Duration::from_secs(config.ping_interval_secs);
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let max_message_bytes = config.max_message_bytes;

    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    match SignalingParser::format(&message) {
                        Ok(text) => {
                            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("Dropping outbound message: {}", e),
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        let frame = match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => {
                info!("Signaling connection {} idle for {:?}, dropping", participant_id, idle_timeout);
                break;
            }
        };

        match frame {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                handle_frame(text_str, &participant_id, &state, &tx, max_message_bytes);
            }
            Ok(Message::Binary(_)) => {
                debug!("Received binary message on signaling channel");
                let _ = tx.send(ServerMessage::error("UNSUPPORTED", "Binary frames are not supported"));
            }
            Ok(Message::Close(_)) => {
                info!("Signaling connection {} closed by peer", participant_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error on {}: {}", participant_id, e);
                break;
            }
        }
    }

    state.registry.unregister(&participant_id);
    send_task.abort();
    info!("Signaling connection handler finished ({})", participant_id);
}

fn handle_frame(
    text: &str,
    participant_id: &ParticipantId,
    state: &SharedState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    max_message_bytes: usize,
) {
    let message = match SignalingParser::parse_client(text, max_message_bytes) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid signaling message from {}: {}", participant_id, e);
            let _ = tx.send(ServerMessage::error("PARSE_ERROR", &e.to_string()));
            return;
        }
    };

    match message {
        ClientMessage::Signal { signal } => match state.registry.relay(participant_id, signal) {
            RelayOutcome::Delivered(recipients) => {
                debug!("Relayed from {} to {} participant(s)", participant_id, recipients.len());
            }
            RelayOutcome::Dropped(reason) => {
                debug!("Signal from {} dropped: {:?}", participant_id, reason);
            }
        },
        ClientMessage::Join { peer_id } => {
            if let Err(e) = state.registry.join(participant_id, &peer_id) {
                warn!("Join from {} failed: {}", participant_id, e);
                let _ = tx.send(ServerMessage::error("JOIN_FAILED", &e.to_string()));
            }
        }
        ClientMessage::Leave => {
            state.registry.leave(participant_id);
        }
    }
}
