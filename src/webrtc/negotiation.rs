//! Call negotiation state machine
//!
//! Owns one call attempt: the lazily created peer connection, the local
//! track set, the remote candidate buffer and the connect deadline. Every
//! operation runs to completion on the call task, so there is no locking.
//!
//! Phase table (anything else is rejected):
//!
//! | phase         | accepted                                                |
//! |---------------|---------------------------------------------------------|
//! | Idle          | start, remote offer, candidate, replace track, close    |
//! | OfferSent     | remote answer, remote offer (glare), candidate, close   |
//! | Answered      | transport connected, renegotiation offer, candidate     |
//! | Connected     | renegotiation offer, candidate, replace track, close    |
//! | Failed/Closed | close (no-op for Closed)                                |
//!
//! Gathering and OfferReceived are transient within a single operation.
//! A terminal attempt only leaves its phase through [`NegotiationState::next_attempt`].

use super::candidates::CandidateBuffer;
use super::media_track::{LocalTrack, TrackSet};
use super::peer_connection::{
    MediaTransport, SessionDescription, TransportEvent, TransportEventSender, TransportFactory, TransportState,
};
use super::signaling::{IceCandidate, ParticipantId, SignalEnvelope};
use super::CallError;
use crate::config::NegotiationConfig;
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Call phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Gathering,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Failed,
    Closed,
}

impl ConnectionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionPhase::Failed | ConnectionPhase::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Gathering => "gathering",
            ConnectionPhase::OfferSent => "offer-sent",
            ConnectionPhase::OfferReceived => "offer-received",
            ConnectionPhase::Answered => "answered",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Failed => "failed",
            ConnectionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation state of one call attempt
pub struct NegotiationState<F: TransportFactory> {
    factory: F,
    connection: Option<F::Transport>,
    tracks: TrackSet,
    phase: ConnectionPhase,
    pending_candidates: CandidateBuffer,
    remote_description_set: bool,
    local_id: Option<ParticipantId>,
    remote_id: Option<ParticipantId>,
    connect_timeout: Duration,
    deadline: Option<Instant>,
    remote_tracks: usize,
    last_error: Option<CallError>,
    signals: mpsc::UnboundedSender<SignalEnvelope>,
    events: TransportEventSender,
}

impl<F: TransportFactory> NegotiationState<F> {
    /// `signals` receives every envelope to relay to the peer; `events` is
    /// handed to each transport the factory creates.
    pub fn new(
        factory: F,
        tracks: TrackSet,
        config: &NegotiationConfig,
        signals: mpsc::UnboundedSender<SignalEnvelope>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            factory,
            connection: None,
            tracks,
            phase: ConnectionPhase::Idle,
            pending_candidates: CandidateBuffer::new(config.max_buffered_candidates),
            remote_description_set: false,
            local_id: None,
            remote_id: None,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            deadline: None,
            remote_tracks: 0,
            last_error: None,
            signals,
            events,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn tracks(&self) -> &TrackSet {
        &self.tracks
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Connect deadline of the running attempt
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn local_id(&self) -> Option<&ParticipantId> {
        self.local_id.as_ref()
    }

    /// Identifier assigned by the relay, used for glare resolution
    pub fn set_local_id(&mut self, id: ParticipantId) {
        self.local_id = Some(id);
    }

    pub fn remote_id(&self) -> Option<&ParticipantId> {
        self.remote_id.as_ref()
    }

    /// Record the partner named by the relay, unless one is already known
    pub fn set_remote_id(&mut self, id: ParticipantId) {
        if self.remote_id.is_none() {
            self.remote_id = Some(id);
        }
    }

    /// Remote tracks announced by the transport
    pub fn remote_tracks(&self) -> usize {
        self.remote_tracks
    }

    /// Error that moved the call to `Failed`
    pub fn last_error(&self) -> Option<&CallError> {
        self.last_error.as_ref()
    }

    /// Install the local track set before a call
    pub fn attach_tracks(&mut self, tracks: TrackSet) -> Result<(), CallError> {
        if self.phase != ConnectionPhase::Idle || self.connection.is_some() {
            return Err(CallError::ProtocolViolation(format!(
                "cannot attach tracks in phase {}",
                self.phase
            )));
        }
        self.tracks = tracks;
        Ok(())
    }

    /// Begin a call as the offerer
    pub async fn start(&mut self) -> Result<(), CallError> {
        if self.phase != ConnectionPhase::Idle {
            return Err(CallError::ProtocolViolation(format!("cannot start a call in phase {}", self.phase)));
        }
        if self.tracks.is_empty() {
            return Err(CallError::DeviceUnavailable("no local tracks attached".to_string()));
        }

        info!("Starting call");
        self.arm_timer();
        if let Err(e) = self.open_connection().await {
            return Err(self.fail(e).await);
        }
        self.set_phase(ConnectionPhase::Gathering);

        let offer = match self.create_local_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e).await),
        };
        if let Err(e) = self.emit(SignalEnvelope::offer(offer.sdp)) {
            return Err(self.fail(e).await);
        }
        self.set_phase(ConnectionPhase::OfferSent);
        Ok(())
    }

    /// Offer relayed from `from`
    pub async fn handle_remote_offer(&mut self, from: ParticipantId, sdp: String) -> Result<(), CallError> {
        match self.phase {
            ConnectionPhase::Idle => {
                self.remote_id = Some(from);
                self.arm_timer();
                if let Err(e) = self.open_connection().await {
                    return Err(self.fail(e).await);
                }
                self.set_phase(ConnectionPhase::OfferReceived);
                if let Err(e) = self.answer_offer(sdp).await {
                    return Err(self.fail(e).await);
                }
                self.set_phase(ConnectionPhase::Answered);
                Ok(())
            }
            ConnectionPhase::OfferSent => {
                if self.wins_glare(&from) {
                    info!("Offer collision with {}: keeping local offer", from);
                    return Ok(());
                }
                info!("Offer collision with {}: rolling back local offer", from);
                self.remote_id = Some(from);
                if let Err(e) = self.rollback_and_answer(sdp).await {
                    return Err(self.fail(e).await);
                }
                self.set_phase(ConnectionPhase::Answered);
                Ok(())
            }
            ConnectionPhase::Answered | ConnectionPhase::Connected => {
                debug!("Renegotiation offer from {} in phase {}", from, self.phase);
                if let Err(e) = self.answer_offer(sdp).await {
                    return Err(self.fail(e).await);
                }
                Ok(())
            }
            ConnectionPhase::Failed | ConnectionPhase::Closed => Err(self.reject_terminal("offer")),
            ConnectionPhase::Gathering | ConnectionPhase::OfferReceived => {
                let err = CallError::ProtocolViolation(format!("unexpected offer in phase {}", self.phase));
                Err(self.fail(err).await)
            }
        }
    }

    /// Answer to our offer
    pub async fn handle_remote_answer(&mut self, sdp: String) -> Result<(), CallError> {
        match self.phase {
            ConnectionPhase::OfferSent => {
                if let Err(e) = self.apply_remote_description(SessionDescription::answer(sdp)).await {
                    return Err(self.fail(e).await);
                }
                self.set_phase(ConnectionPhase::Answered);
                Ok(())
            }
            ConnectionPhase::Failed | ConnectionPhase::Closed => Err(self.reject_terminal("answer")),
            phase => {
                let err = CallError::ProtocolViolation(format!("unexpected answer in phase {}", phase));
                Err(self.fail(err).await)
            }
        }
    }

    /// Trickled candidate from the peer
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        if self.phase.is_terminal() {
            return Err(self.reject_terminal("ice-candidate"));
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            debug!("Buffered remote candidate ({} pending)", self.pending_candidates.len());
            return Ok(());
        }
        let result = match self.connection() {
            Ok(connection) => connection.add_ice_candidate(candidate).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            return Err(self.fail(e).await);
        }
        Ok(())
    }

    /// Apply one transport event
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), CallError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.phase.is_terminal() {
                    return Ok(());
                }
                if let Err(e) = self.emit(SignalEnvelope::ice_candidate(candidate)) {
                    return Err(self.fail(e).await);
                }
                Ok(())
            }
            TransportEvent::StateChanged(state) => self.handle_transport_state(state).await,
            TransportEvent::RemoteTrack(kind) => {
                self.remote_tracks += 1;
                info!("Remote {} track attached", kind);
                Ok(())
            }
        }
    }

    /// Connectivity change reported by the transport
    pub async fn handle_transport_state(&mut self, state: TransportState) -> Result<(), CallError> {
        match state {
            TransportState::Connected => {
                if self.phase == ConnectionPhase::Answered {
                    self.deadline = None;
                    self.set_phase(ConnectionPhase::Connected);
                    info!("Call connected");
                }
                Ok(())
            }
            TransportState::Failed => {
                if self.phase.is_terminal() {
                    return Ok(());
                }
                let err = CallError::PeerUnreachable("transport reported failure".to_string());
                Err(self.fail(err).await)
            }
            TransportState::Closed => {
                if !self.phase.is_terminal() {
                    info!("Transport closed, ending call");
                    self.close().await;
                }
                Ok(())
            }
            TransportState::Disconnected => {
                warn!("Transport disconnected in phase {}", self.phase);
                Ok(())
            }
            TransportState::New | TransportState::Connecting => {
                debug!("Transport state {:?}", state);
                Ok(())
            }
        }
    }

    /// Deadline expiry; a no-op when connectivity was reached in time
    pub async fn on_timeout(&mut self) -> Result<(), CallError> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        if Instant::now() < deadline || self.phase == ConnectionPhase::Connected || self.phase.is_terminal() {
            return Ok(());
        }
        let err = CallError::PeerUnreachable(format!(
            "no connectivity within {}s",
            self.connect_timeout.as_secs()
        ));
        Err(self.fail(err).await)
    }

    /// The signaling channel dropped under the call
    pub async fn channel_lost(&mut self, reason: &str) -> Result<(), CallError> {
        if self.phase.is_terminal() {
            return Ok(());
        }
        Err(self.fail(CallError::ChannelLost(reason.to_string())).await)
    }

    /// The relay reported that `id` left
    pub async fn handle_peer_left(&mut self, id: &ParticipantId) {
        if self.phase.is_terminal() {
            return;
        }
        if self.remote_id.as_ref().is_some_and(|remote| remote != id) {
            debug!("Ignoring departure of {}, not our peer", id);
            return;
        }
        info!("Peer {} left, closing call", id);
        self.close().await;
    }

    /// Swap the outbound track of `track.kind` without renegotiating.
    /// Returns the previous track so the caller can release it.
    pub async fn replace_track(&mut self, track: LocalTrack) -> Result<Option<LocalTrack>, CallError> {
        let before_call = self.phase == ConnectionPhase::Idle && self.connection.is_none();
        if self.phase != ConnectionPhase::Connected && !before_call {
            return Err(CallError::ProtocolViolation(format!(
                "cannot replace {} track in phase {}",
                track.kind, self.phase
            )));
        }

        if let Some(connection) = self.connection.as_mut() {
            let swapped = connection
                .replace_sender_track(track.kind, &track)
                .await
                .map_err(|e| CallError::DeviceUnavailable(format!("{} track replacement failed: {}", track.kind, e)))?;
            if !swapped {
                debug!("No {} sender, updating preview only", track.kind);
            }
        }

        info!("Replaced local {} track with {}", track.kind, track.label);
        Ok(self.tracks.replace(track))
    }

    /// Reset an ended attempt back to `Idle` for a new call. The factory,
    /// local tracks and local id carry over; the peer, buffered candidates
    /// and error of the old attempt do not. Returns false if the current
    /// attempt is still live.
    pub fn next_attempt(&mut self) -> bool {
        if !self.phase.is_terminal() {
            return false;
        }
        self.connection = None;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.remote_id = None;
        self.deadline = None;
        self.remote_tracks = 0;
        self.last_error = None;
        self.set_phase(ConnectionPhase::Idle);
        true
    }

    /// Release the connection and end the call. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        self.release_connection().await;
        self.set_phase(ConnectionPhase::Closed);
    }

    async fn open_connection(&mut self) -> Result<(), CallError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let mut connection = self.factory.create(self.events.clone()).await?;
        for track in self.tracks.tracks() {
            if let Err(e) = connection.add_track(track).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }
        debug!("Peer connection created with {} local tracks", self.tracks.tracks().len());
        self.connection = Some(connection);
        Ok(())
    }

    async fn create_local_offer(&mut self) -> Result<SessionDescription, CallError> {
        let connection = self.connection()?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Apply a remote offer, then create, apply and emit the answer
    async fn answer_offer(&mut self, sdp: String) -> Result<(), CallError> {
        self.apply_remote_description(SessionDescription::offer(sdp)).await?;
        let connection = self.connection()?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.emit(SignalEnvelope::answer(answer.sdp))
    }

    async fn rollback_and_answer(&mut self, sdp: String) -> Result<(), CallError> {
        self.connection()?.rollback_local_description().await?;
        self.answer_offer(sdp).await
    }

    async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<(), CallError> {
        self.connection()?.set_remote_description(description).await?;
        self.remote_description_set = true;

        let pending = self.pending_candidates.drain();
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Flushing {} buffered candidates", pending.len());
        let connection = self.connection()?;
        for candidate in pending {
            connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Lesser participant identifier keeps its offer
    fn wins_glare(&self, remote: &ParticipantId) -> bool {
        match &self.local_id {
            Some(local) => local < remote,
            None => false,
        }
    }

    fn connection(&mut self) -> Result<&mut F::Transport, CallError> {
        self.connection
            .as_mut()
            .ok_or_else(|| CallError::ProtocolViolation("no peer connection".to_string()))
    }

    fn emit(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        debug!("Sending {}", envelope.kind());
        self.signals
            .send(envelope)
            .map_err(|_| CallError::ChannelLost("signaling queue closed".to_string()))
    }

    fn arm_timer(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.connect_timeout);
        }
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        if self.phase != phase {
            debug!("Call phase change: {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn reject_terminal(&self, what: &str) -> CallError {
        warn!("Ignoring {} in terminal phase {}", what, self.phase);
        CallError::ProtocolViolation(format!("{} received in phase {}", what, self.phase))
    }

    async fn release_connection(&mut self) {
        self.deadline = None;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!("Error closing peer connection: {}", e);
            }
        }
    }

    /// Abort the attempt; returns `err` for propagation
    async fn fail(&mut self, err: CallError) -> CallError {
        if !self.phase.is_terminal() {
            error!("Call failed in phase {}: {}", self.phase, err);
            self.release_connection().await;
            self.last_error = Some(err.clone());
            self.set_phase(ConnectionPhase::Failed);
        }
        err
    }
}
