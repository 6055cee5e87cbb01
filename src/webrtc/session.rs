//! Call Session
//!
//! Drives a [`NegotiationState`] from a single task. Commands from the
//! application, relay messages, transport events and the connect timer are
//! handled one at a time, so no handler ever observes a half-applied
//! transition. The session outlives individual calls: once an attempt has
//! failed or closed, a new `start` or a new offer from the peer begins a
//! fresh attempt on the same relay connection.

use super::media_track::{CaptureRequest, DeviceKind, LocalTrack, MediaCapture, TrackSet};
use super::negotiation::{ConnectionPhase, NegotiationState};
use super::peer_connection::{TransportEvent, TransportFactory, TransportState};
use super::signaling::{ClientMessage, ParticipantId, ServerMessage, SignalEnvelope};
use super::CallError;
use crate::config::NegotiationConfig;
use crate::transport::SignalingChannel;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

/// Snapshot published after every handled event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub phase: ConnectionPhase,
    pub transport: TransportState,
    pub participant_id: Option<ParticipantId>,
    pub peer_id: Option<ParticipantId>,
    pub remote_tracks: usize,
    pub error: Option<CallError>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            transport: TransportState::New,
            participant_id: None,
            peer_id: None,
            remote_tracks: 0,
            error: None,
        }
    }
}

enum CallCommand {
    Start {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ReplaceTrack {
        track: LocalTrack,
        reply: oneshot::Sender<Result<Option<LocalTrack>, CallError>>,
    },
    Join {
        peer_id: ParticipantId,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Application-side handle to a running call session
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    /// Start the call as the offerer
    pub async fn start(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(CallCommand::Start { reply })?;
        rx.await.map_err(|_| Self::gone())?
    }

    /// Swap an outbound track in place; returns the track it replaced
    pub async fn replace_track(&self, track: LocalTrack) -> Result<Option<LocalTrack>, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(CallCommand::ReplaceTrack { track, reply })?;
        rx.await.map_err(|_| Self::gone())?
    }

    /// Open `device_id` and swap it in. A capture failure leaves the current
    /// track and sender untouched.
    pub async fn switch_device<C: MediaCapture>(
        &self,
        capture: &mut C,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<Option<LocalTrack>, CallError> {
        let track_kind = kind.track_kind().ok_or_else(|| {
            CallError::DeviceUnavailable(format!("{} is not a capture device", device_id))
        })?;
        let mut tracks = capture.capture(CaptureRequest::single_device(track_kind, device_id)).await?;
        let track = tracks
            .take(track_kind)
            .ok_or_else(|| CallError::DeviceUnavailable(format!("device {} produced no {} track", device_id, track_kind)))?;
        self.replace_track(track).await
    }

    /// Ask the relay to pair with a specific participant
    pub fn join(&self, peer_id: ParticipantId) -> Result<(), CallError> {
        self.send(CallCommand::Join { peer_id })
    }

    /// End the call and the session; returns once the connection is released
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(CallCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`
    pub async fn wait_for<P>(&self, mut predicate: P) -> Result<CallStatus, CallError>
    where
        P: FnMut(&CallStatus) -> bool,
    {
        let mut status = self.status.clone();
        let current = status.wait_for(|s| predicate(s)).await.map_err(|_| Self::gone())?;
        Ok(current.clone())
    }

    fn send(&self, command: CallCommand) -> Result<(), CallError> {
        self.commands.send(command).map_err(|_| Self::gone())
    }

    fn gone() -> CallError {
        CallError::ProtocolViolation("call session has ended".to_string())
    }
}

/// Event loop owning the calls made over one relay connection
pub struct CallSession<F: TransportFactory> {
    state: NegotiationState<F>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    channel: SignalingChannel,
    channel_open: bool,
    paired_peer: Option<ParticipantId>,
    closing: bool,
    signals: mpsc::UnboundedReceiver<SignalEnvelope>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport_state: TransportState,
    status: watch::Sender<CallStatus>,
}

impl<F> CallSession<F>
where
    F: TransportFactory + 'static,
{
    pub fn new(factory: F, tracks: TrackSet, config: &NegotiationConfig, channel: SignalingChannel) -> (Self, CallHandle) {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (event_tx, transport_events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CallStatus::default());

        let session = Self {
            state: NegotiationState::new(factory, tracks, config, signal_tx, event_tx),
            commands,
            channel,
            channel_open: true,
            paired_peer: None,
            closing: false,
            signals,
            transport_events,
            transport_state: TransportState::New,
            status: status_tx,
        };
        let handle = CallHandle {
            commands: command_tx,
            status: status_rx,
        };
        (session, handle)
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<CallStatus> {
        tokio::spawn(self.run())
    }

    /// Run until closed through a handle or every handle is dropped
    pub async fn run(mut self) -> CallStatus {
        loop {
            let deadline = self.state.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All call handles dropped, closing");
                        self.state.close().await;
                        self.closing = true;
                    }
                },
                message = self.channel.inbound.recv(), if self.channel_open => match message {
                    Some(message) => self.handle_server_message(message).await,
                    None => {
                        self.channel_open = false;
                        warn!("Signaling channel closed");
                        let result = self.state.channel_lost("relay connection closed").await;
                        self.report(result);
                    }
                },
                Some(envelope) = self.signals.recv() => self.forward(envelope).await,
                Some(event) = self.transport_events.recv() => {
                    if let TransportEvent::StateChanged(state) = &event {
                        self.transport_state = *state;
                    }
                    let result = self.state.handle_transport_event(event).await;
                    self.report(result);
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let result = self.state.on_timeout().await;
                    self.report(result);
                },
            }

            self.publish();
            if self.closing {
                break;
            }
        }

        info!("Call session finished");
        self.status.borrow().clone()
    }

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::Start { reply } => {
                if !self.channel_open {
                    let _ = reply.send(Err(CallError::ChannelLost("relay connection closed".to_string())));
                    return;
                }
                self.renew_attempt();
                let result = self.state.start().await;
                let _ = reply.send(result);
            }
            CallCommand::ReplaceTrack { track, reply } => {
                let result = self.state.replace_track(track).await;
                let _ = reply.send(result);
            }
            CallCommand::Join { peer_id } => {
                self.state.set_remote_id(peer_id.clone());
                self.send_to_relay(ClientMessage::Join { peer_id }).await;
            }
            CallCommand::Close { reply } => {
                self.state.close().await;
                self.closing = true;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected { participant_id } => {
                info!("Registered with relay as {}", participant_id);
                self.state.set_local_id(participant_id);
            }
            ServerMessage::Signal { from, signal } => {
                if matches!(signal, SignalEnvelope::Offer { .. }) {
                    self.renew_attempt();
                }
                if let Some(peer) = self.state.remote_id() {
                    if *peer != from {
                        warn!("Dropping {} from {}, call peer is {}", signal.kind(), from, peer);
                        return;
                    }
                }
                debug!("Received {} from {}", signal.kind(), from);
                let result = match signal {
                    SignalEnvelope::Offer { sdp } => self.state.handle_remote_offer(from, sdp).await,
                    SignalEnvelope::Answer { sdp } => {
                        self.state.set_remote_id(from);
                        self.state.handle_remote_answer(sdp).await
                    }
                    SignalEnvelope::IceCandidate { candidate } => self.state.handle_remote_candidate(candidate).await,
                };
                self.report(result);
            }
            ServerMessage::Paired { peer_id } => {
                info!("Paired with {}", peer_id);
                self.paired_peer = Some(peer_id.clone());
                self.state.set_remote_id(peer_id);
            }
            ServerMessage::PeerLeft { participant_id } => {
                if self.paired_peer.as_ref() == Some(&participant_id) {
                    self.paired_peer = None;
                }
                self.state.handle_peer_left(&participant_id).await;
            }
            ServerMessage::Error { code, message } => {
                warn!("Relay rejected request: {} ({})", message, code);
            }
        }
    }

    /// Replace an ended attempt with a fresh one, keeping the current pairing
    fn renew_attempt(&mut self) {
        if !self.state.next_attempt() {
            return;
        }
        info!("Starting a new call attempt");
        // leftovers of the released connection
        while self.transport_events.try_recv().is_ok() {}
        while self.signals.try_recv().is_ok() {}
        self.transport_state = TransportState::New;
        if let Some(peer) = self.paired_peer.clone() {
            self.state.set_remote_id(peer);
        }
    }

    async fn forward(&mut self, envelope: SignalEnvelope) {
        if self.state.phase().is_terminal() {
            debug!("Dropping outbound {} after call ended", envelope.kind());
            return;
        }
        self.send_to_relay(ClientMessage::Signal { signal: envelope }).await;
    }

    async fn send_to_relay(&mut self, message: ClientMessage) {
        if !self.channel_open {
            return;
        }
        if self.channel.outbound.send(message).is_err() {
            self.channel_open = false;
            let result = self.state.channel_lost("relay writer stopped").await;
            self.report(result);
        }
    }

    fn report(&self, result: Result<(), CallError>) {
        if let Err(e) = result {
            if e.is_fatal() {
                error!("Call error: {}", e);
            } else {
                warn!("Call error: {}", e);
            }
        }
    }

    fn publish(&self) {
        let status = CallStatus {
            phase: self.state.phase(),
            transport: self.transport_state,
            participant_id: self.state.local_id().cloned(),
            peer_id: self.state.remote_id().cloned(),
            remote_tracks: self.state.remote_tracks(),
            error: self.state.last_error().cloned(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}
