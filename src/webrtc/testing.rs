//! In-memory collaborators for tests

use super::media_track::{
    CaptureRequest, DeviceConstraint, DeviceEnumerator, DeviceInfo, LocalTrack, MediaCapture, TrackKind, TrackSet,
};
use super::peer_connection::{
    MediaTransport, SdpType, SessionDescription, TransportEvent, TransportEventSender, TransportFactory, TransportState,
};
use super::signaling::IceCandidate;
use super::CallError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    Rollback,
    AddCandidate(IceCandidate),
    ReplaceTrack(TrackKind, String),
    Close,
}

#[derive(Default)]
struct FakeLog {
    calls: Vec<TransportCall>,
    senders: HashMap<TrackKind, String>,
    created: usize,
    fail_replace: bool,
}

/// Factory whose transports record every call into a shared log and report
/// connectivity once both descriptions are applied
#[derive(Clone, Default)]
pub struct FakeFactory {
    log: Arc<Mutex<FakeLog>>,
}

impl FakeFactory {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.log.lock().calls.clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.log
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Track ID currently carried by the sender of `kind`
    pub fn sender_track(&self, kind: TrackKind) -> Option<String> {
        self.log.lock().senders.get(&kind).cloned()
    }

    pub fn created(&self) -> usize {
        self.log.lock().created
    }

    pub fn fail_replace(&self, fail: bool) {
        self.log.lock().fail_replace = fail;
    }
}

impl TransportFactory for FakeFactory {
    type Transport = FakeTransport;

    async fn create(&mut self, events: TransportEventSender) -> Result<FakeTransport, CallError> {
        let mut log = self.log.lock();
        log.created += 1;
        log.senders.clear();
        Ok(FakeTransport {
            log: Arc::clone(&self.log),
            events,
            local_set: false,
            remote_set: false,
            connected: false,
            remote_kinds: HashSet::new(),
            serial: log.created,
        })
    }
}

pub struct FakeTransport {
    log: Arc<Mutex<FakeLog>>,
    events: TransportEventSender,
    local_set: bool,
    remote_set: bool,
    connected: bool,
    remote_kinds: HashSet<TrackKind>,
    serial: usize,
}

impl FakeTransport {
    fn record(&self, call: TransportCall) {
        self.log.lock().calls.push(call);
    }

    fn describe(&self, role: &str) -> String {
        let log = self.log.lock();
        let mut sdp = format!("v=0\r\no=fake-{} {}\r\n", role, self.serial);
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if log.senders.contains_key(&kind) {
                sdp.push_str(&format!("m={}\r\n", kind));
            }
        }
        sdp
    }

    fn maybe_connect(&mut self) {
        if self.local_set && self.remote_set && !self.connected {
            self.connected = true;
            let _ = self.events.send(TransportEvent::StateChanged(TransportState::Connecting));
            let _ = self.events.send(TransportEvent::StateChanged(TransportState::Connected));
        }
    }
}

impl MediaTransport for FakeTransport {
    async fn add_track(&mut self, track: &LocalTrack) -> Result<(), CallError> {
        self.record(TransportCall::AddTrack(track.id.clone()));
        self.log.lock().senders.insert(track.kind, track.id.clone());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        self.record(TransportCall::CreateOffer);
        Ok(SessionDescription::offer(self.describe("offer")))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, CallError> {
        self.record(TransportCall::CreateAnswer);
        Ok(SessionDescription::answer(self.describe("answer")))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), CallError> {
        self.record(TransportCall::SetLocal(description.sdp_type));
        self.local_set = true;
        let candidate = IceCandidate::new(format!("candidate:{} 1 udp 2122260223 127.0.0.1 5000 typ host", self.serial));
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), CallError> {
        if !description.sdp.starts_with("v=0") {
            return Err(CallError::Transport("malformed session description".to_string()));
        }
        self.record(TransportCall::SetRemote(description.sdp_type));
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if description.sdp.contains(&format!("m={}", kind)) && self.remote_kinds.insert(kind) {
                let _ = self.events.send(TransportEvent::RemoteTrack(kind));
            }
        }
        self.remote_set = true;
        self.maybe_connect();
        Ok(())
    }

    async fn rollback_local_description(&mut self) -> Result<(), CallError> {
        self.record(TransportCall::Rollback);
        self.local_set = false;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        self.record(TransportCall::AddCandidate(candidate));
        Ok(())
    }

    async fn replace_sender_track(&mut self, kind: TrackKind, track: &LocalTrack) -> Result<bool, CallError> {
        let mut log = self.log.lock();
        if log.fail_replace {
            return Err(CallError::Transport("sender rejected track".to_string()));
        }
        if !log.senders.contains_key(&kind) {
            return Ok(false);
        }
        log.senders.insert(kind, track.id.clone());
        log.calls.push(TransportCall::ReplaceTrack(kind, track.id.clone()));
        Ok(true)
    }

    async fn close(&mut self) -> Result<(), CallError> {
        self.record(TransportCall::Close);
        Ok(())
    }
}

/// Capture backend over a fixed device list
#[derive(Default)]
pub struct FakeCapture {
    pub devices: Vec<DeviceInfo>,
    pub deny_permission: bool,
}

impl FakeCapture {
    fn open(&self, kind: TrackKind, constraint: &DeviceConstraint) -> Result<Option<LocalTrack>, CallError> {
        match constraint {
            DeviceConstraint::Skip => Ok(None),
            DeviceConstraint::Any => Ok(Some(LocalTrack::new(kind, None))),
            DeviceConstraint::Exact(id) => {
                let known = self
                    .devices
                    .iter()
                    .any(|d| &d.device_id == id && d.kind.track_kind() == Some(kind));
                if !known {
                    return Err(CallError::DeviceUnavailable(format!("no {} device {}", kind, id)));
                }
                Ok(Some(LocalTrack::new(kind, Some(id.clone()))))
            }
        }
    }
}

impl MediaCapture for FakeCapture {
    async fn capture(&mut self, request: CaptureRequest) -> Result<TrackSet, CallError> {
        if self.deny_permission {
            return Err(CallError::PermissionDenied("user dismissed the prompt".to_string()));
        }
        let mut tracks = Vec::new();
        tracks.extend(self.open(TrackKind::Audio, &request.audio)?);
        tracks.extend(self.open(TrackKind::Video, &request.video)?);
        Ok(TrackSet::new(tracks))
    }
}

impl DeviceEnumerator for FakeCapture {
    async fn devices(&mut self) -> Result<Vec<DeviceInfo>, CallError> {
        Ok(self.devices.clone())
    }
}
