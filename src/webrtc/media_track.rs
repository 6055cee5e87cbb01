//! Local media tracks and capture collaborators
//!
//! The crate never touches camera or microphone hardware. Tracks are
//! descriptors handed out by a [`MediaCapture`] implementation; the
//! transport maps them onto real media senders.

use super::CallError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// Media kind of a track or sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One local outbound track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Unique track ID
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Capture device the track was opened from
    pub device_id: Option<String>,
    /// Human-readable device label
    pub label: String,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, device_id: Option<String>) -> Self {
        let label = device_id
            .as_deref()
            .map(|id| format!("{} {}", kind, short_id(id)))
            .unwrap_or_else(|| format!("default {}", kind));
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            device_id,
            label,
        }
    }
}

/// The local track set of one call attempt, at most one track per kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet {
    tracks: Vec<LocalTrack>,
}

impl TrackSet {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        let mut set = TrackSet::default();
        for track in tracks {
            set.replace(track);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn get(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Install `track`, returning the previous track of the same kind
    pub fn replace(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match self.tracks.iter_mut().find(|t| t.kind == track.kind) {
            Some(slot) => Some(std::mem::replace(slot, track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    /// Remove and return the track of `kind`
    pub fn take(&mut self, kind: TrackKind) -> Option<LocalTrack> {
        let index = self.tracks.iter().position(|t| t.kind == kind)?;
        Some(self.tracks.remove(index))
    }
}

/// Device category as reported by the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

impl DeviceKind {
    /// Track kind produced by capturing from this device (inputs only)
    pub fn track_kind(&self) -> Option<TrackKind> {
        match self {
            DeviceKind::AudioInput => Some(TrackKind::Audio),
            DeviceKind::VideoInput => Some(TrackKind::Video),
            DeviceKind::AudioOutput => None,
        }
    }
}

/// One enumerated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub label: String,
}

impl DeviceInfo {
    /// Label to show, falling back to a shortened ID when the browser hides labels
    pub fn display_label(&self) -> String {
        if !self.label.is_empty() {
            return self.label.clone();
        }
        let prefix = match self.kind {
            DeviceKind::VideoInput => "Camera",
            DeviceKind::AudioInput => "Microphone",
            DeviceKind::AudioOutput => "Speaker",
        };
        format!("{} {}", prefix, short_id(&self.device_id))
    }
}

/// Which device to open for one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceConstraint {
    /// Do not capture this kind
    Skip,
    /// Any available device
    Any,
    /// Exactly this device
    Exact(String),
}

/// Capture request passed to [`MediaCapture`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: DeviceConstraint,
    pub video: DeviceConstraint,
}

impl CaptureRequest {
    /// Camera and microphone, whichever devices the platform picks
    pub fn default_devices() -> Self {
        Self {
            audio: DeviceConstraint::Any,
            video: DeviceConstraint::Any,
        }
    }

    /// A single track of `kind` from `device_id`
    pub fn single_device(kind: TrackKind, device_id: &str) -> Self {
        let exact = DeviceConstraint::Exact(device_id.to_string());
        match kind {
            TrackKind::Audio => Self { audio: exact, video: DeviceConstraint::Skip },
            TrackKind::Video => Self { audio: DeviceConstraint::Skip, video: exact },
        }
    }

    /// Request the first enumerated input of each kind
    pub fn from_devices(devices: &[DeviceInfo]) -> Self {
        let pick = |kind: DeviceKind| {
            first_device(devices, kind)
                .map(|d| DeviceConstraint::Exact(d.device_id.clone()))
                .unwrap_or(DeviceConstraint::Any)
        };
        Self {
            audio: pick(DeviceKind::AudioInput),
            video: pick(DeviceKind::VideoInput),
        }
    }
}

/// Media capture collaborator
pub trait MediaCapture: Send {
    /// Open the requested devices. Fails with `PermissionDenied` or
    /// `DeviceUnavailable`.
    fn capture(
        &mut self,
        request: CaptureRequest,
    ) -> impl Future<Output = Result<TrackSet, CallError>> + Send;
}

/// Device enumeration collaborator
pub trait DeviceEnumerator: Send {
    fn devices(&mut self) -> impl Future<Output = Result<Vec<DeviceInfo>, CallError>> + Send;
}

/// First device of `kind`, the picker's default selection
pub fn first_device(devices: &[DeviceInfo], kind: DeviceKind) -> Option<&DeviceInfo> {
    devices.iter().find(|d| d.kind == kind)
}

/// Enumerate devices and open the default camera and microphone
pub async fn capture_default_tracks<E, C>(enumerator: &mut E, capture: &mut C) -> Result<TrackSet, CallError>
where
    E: DeviceEnumerator,
    C: MediaCapture,
{
    let devices = enumerator.devices().await?;
    capture.capture(CaptureRequest::from_devices(&devices)).await
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_same_kind_only() {
        let mic = LocalTrack::new(TrackKind::Audio, Some("mic-1".into()));
        let cam = LocalTrack::new(TrackKind::Video, Some("cam-1".into()));
        let mut set = TrackSet::new(vec![mic.clone(), cam.clone()]);

        let cam2 = LocalTrack::new(TrackKind::Video, Some("cam-2".into()));
        let previous = set.replace(cam2.clone());
        assert_eq!(previous, Some(cam));
        assert_eq!(set.get(TrackKind::Video), Some(&cam2));
        assert_eq!(set.get(TrackKind::Audio), Some(&mic));
        assert_eq!(set.tracks().len(), 2);
    }

    #[test]
    fn duplicate_kinds_collapse() {
        let a = LocalTrack::new(TrackKind::Audio, None);
        let b = LocalTrack::new(TrackKind::Audio, None);
        let set = TrackSet::new(vec![a, b.clone()]);
        assert_eq!(set.tracks(), &[b]);
    }

    #[test]
    fn device_labels_fall_back_to_short_id() {
        let dev = DeviceInfo {
            device_id: "0123456789abcdef".into(),
            kind: DeviceKind::VideoInput,
            label: String::new(),
        };
        assert_eq!(dev.display_label(), "Camera 01234567");
        assert_eq!(DeviceKind::AudioOutput.track_kind(), None);
    }

    #[test]
    fn default_request_uses_first_inputs() {
        let devices: Vec<DeviceInfo> = serde_json::from_str(
            r#"[
                {"deviceId":"spk","kind":"audiooutput","label":"Speakers"},
                {"deviceId":"cam-a","kind":"videoinput","label":"Front"},
                {"deviceId":"cam-b","kind":"videoinput","label":"Back"}
            ]"#,
        )
        .unwrap();
        let request = CaptureRequest::from_devices(&devices);
        assert_eq!(request.video, DeviceConstraint::Exact("cam-a".into()));
        assert_eq!(request.audio, DeviceConstraint::Any);
    }
}
