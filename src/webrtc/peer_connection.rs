//! Media transport collaborator
//!
//! The negotiation state machine drives a peer connection it does not
//! implement. [`MediaTransport`] is the surface it needs; asynchronous
//! callbacks (`onicecandidate`, `onconnectionstatechange`, `ontrack`) are
//! delivered as [`TransportEvent`] messages instead of closures touching
//! shared state.

use super::media_track::{LocalTrack, TrackKind};
use super::signaling::IceCandidate;
use super::CallError;
use std::future::Future;
use tokio::sync::mpsc;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description plus its role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// Transport-level connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events raised by the transport, consumed one at a time by the call loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the peer
    LocalCandidate(IceCandidate),
    /// Connection state change
    StateChanged(TransportState),
    /// The peer started sending a track of this kind
    RemoteTrack(TrackKind),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One peer connection
pub trait MediaTransport: Send {
    /// Attach an outbound track, creating its sender
    fn add_track(&mut self, track: &LocalTrack) -> impl Future<Output = Result<(), CallError>> + Send;

    fn create_offer(&mut self) -> impl Future<Output = Result<SessionDescription, CallError>> + Send;

    fn create_answer(&mut self) -> impl Future<Output = Result<SessionDescription, CallError>> + Send;

    fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), CallError>> + Send;

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), CallError>> + Send;

    /// Discard a pending local offer
    fn rollback_local_description(&mut self) -> impl Future<Output = Result<(), CallError>> + Send;

    fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), CallError>> + Send;

    /// Swap the track carried by the sender of `kind` in place.
    /// Returns `Ok(false)` when no sender of that kind exists.
    fn replace_sender_track(
        &mut self,
        kind: TrackKind,
        track: &LocalTrack,
    ) -> impl Future<Output = Result<bool, CallError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), CallError>> + Send;
}

/// Creates a fresh peer connection per call attempt
pub trait TransportFactory: Send {
    type Transport: MediaTransport;

    fn create(
        &mut self,
        events: TransportEventSender,
    ) -> impl Future<Output = Result<Self::Transport, CallError>> + Send;
}

#[cfg(feature = "webrtc-transport")]
pub use rtc::{WebRtcTransport, WebRtcTransportFactory};

#[cfg(feature = "webrtc-transport")]
mod rtc {
    use super::*;
    use crate::config::IceServerConfig;
    use log::{debug, info};
    use std::collections::HashMap;
    use std::sync::Arc;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::api::APIBuilder;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
    use webrtc::ice_transport::ice_server::RTCIceServer;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
    use webrtc::track::track_local::TrackLocal;

    impl From<RTCPeerConnectionState> for TransportState {
        fn from(state: RTCPeerConnectionState) -> Self {
            match state {
                RTCPeerConnectionState::New => TransportState::New,
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
                _ => TransportState::New,
            }
        }
    }

    /// Builds webrtc-rs peer connections with the configured ICE servers
    pub struct WebRtcTransportFactory {
        ice_servers: Vec<IceServerConfig>,
    }

    impl WebRtcTransportFactory {
        pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
            Self { ice_servers }
        }
    }

    impl TransportFactory for WebRtcTransportFactory {
        type Transport = WebRtcTransport;

        async fn create(&mut self, events: TransportEventSender) -> Result<WebRtcTransport, CallError> {
            let mut media_engine = MediaEngine::default();
            media_engine
                .register_default_codecs()
                .map_err(|e| CallError::Transport(format!("Failed to register codecs: {}", e)))?;

            let mut registry = Registry::new();
            registry = register_default_interceptors(registry, &mut media_engine)
                .map_err(|e| CallError::Transport(format!("Failed to register interceptors: {}", e)))?;

            let api = APIBuilder::new()
                .with_media_engine(media_engine)
                .with_interceptor_registry(registry)
                .build();

            let ice_servers = self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect();

            let rtc_config = RTCConfiguration {
                ice_servers,
                ..Default::default()
            };

            let peer_connection = api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to create peer connection: {}", e)))?;
            let peer_connection = Arc::new(peer_connection);

            let candidate_tx = events.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate| {
                let candidate_tx = candidate_tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    if let Ok(init) = candidate.to_json() {
                        let _ = candidate_tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                })
            }));

            let state_tx = events.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                let state_tx = state_tx.clone();
                Box::pin(async move {
                    debug!("Peer connection state: {:?}", state);
                    let _ = state_tx.send(TransportEvent::StateChanged(TransportState::from(state)));
                })
            }));

            let track_tx = events;
            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let track_tx = track_tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    info!("Remote {} track started", kind);
                    let _ = track_tx.send(TransportEvent::RemoteTrack(kind));
                })
            }));

            Ok(WebRtcTransport {
                peer_connection,
                tracks: HashMap::new(),
            })
        }
    }

    /// webrtc-rs peer connection with sample-based local tracks
    pub struct WebRtcTransport {
        peer_connection: Arc<RTCPeerConnection>,
        tracks: HashMap<String, Arc<TrackLocalStaticSample>>,
    }

    impl WebRtcTransport {
        /// Sample writer for a local track, for the capture pipeline to feed
        pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
            self.tracks.get(track_id).cloned()
        }

        fn sample_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
            let capability = match track.kind {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_string(),
                    rtcp_feedback: vec![],
                },
            };
            Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id.clone(),
                "callbridge".to_string(),
            ))
        }
    }

    fn codec_type(kind: TrackKind) -> RTPCodecType {
        match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        }
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, CallError> {
        let result = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|e| CallError::Transport(format!("Invalid SDP: {}", e)))
    }

    impl MediaTransport for WebRtcTransport {
        async fn add_track(&mut self, track: &LocalTrack) -> Result<(), CallError> {
            let local = Self::sample_track(track);
            self.peer_connection
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to add {} track: {}", track.kind, e)))?;
            self.tracks.insert(track.id.clone(), local);
            Ok(())
        }

        async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
            let offer = self
                .peer_connection
                .create_offer(None)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to create offer: {}", e)))?;
            Ok(SessionDescription::offer(offer.sdp))
        }

        async fn create_answer(&mut self) -> Result<SessionDescription, CallError> {
            let answer = self
                .peer_connection
                .create_answer(None)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to create answer: {}", e)))?;
            Ok(SessionDescription::answer(answer.sdp))
        }

        async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), CallError> {
            let description = to_rtc(description)?;
            self.peer_connection
                .set_local_description(description)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to set local description: {}", e)))
        }

        async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), CallError> {
            let description = to_rtc(description)?;
            self.peer_connection
                .set_remote_description(description)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to set remote description: {}", e)))
        }

        async fn rollback_local_description(&mut self) -> Result<(), CallError> {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.peer_connection
                .set_local_description(rollback)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to roll back local offer: {}", e)))
        }

        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            self.peer_connection
                .add_ice_candidate(init)
                .await
                .map_err(|e| CallError::Transport(format!("Failed to add ICE candidate: {}", e)))
        }

        async fn replace_sender_track(&mut self, kind: TrackKind, track: &LocalTrack) -> Result<bool, CallError> {
            for sender in self.peer_connection.get_senders().await {
                let Some(current) = sender.track().await else {
                    continue;
                };
                if current.kind() != codec_type(kind) {
                    continue;
                }
                let replacement = Self::sample_track(track);
                sender
                    .replace_track(Some(Arc::clone(&replacement) as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(|e| CallError::Transport(format!("Failed to replace {} track: {}", kind, e)))?;
                self.tracks.remove(current.id());
                self.tracks.insert(track.id.clone(), replacement);
                return Ok(true);
            }
            Ok(false)
        }

        async fn close(&mut self) -> Result<(), CallError> {
            self.tracks.clear();
            self.peer_connection
                .close()
                .await
                .map_err(|e| CallError::Transport(format!("Failed to close connection: {}", e)))
        }
    }
}
