use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Opaque identifier of a remote endpoint, assigned by the relay layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network path proposed by one side, in its JSON wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(
        candidate: impl Into<String>,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.map(str::to_string),
            sdp_mline_index,
        }
    }

    /// A candidate is usable only if it has a body and names its media section.
    pub fn validate(&self) -> Result<(), String> {
        if self.candidate.trim().is_empty() {
            return Err("candidate string is empty".into());
        }
        if self.sdp_mid.is_none() && self.sdp_mline_index.is_none() {
            return Err("candidate has neither sdpMid nor sdpMLineIndex".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    /// Whether a remote candidate may be applied once a remote description exists.
    pub fn accepts_candidates(self) -> bool {
        matches!(self, SignalingState::Stable | SignalingState::HaveRemoteOffer)
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, IceConnectionState::New | IceConnectionState::Checking)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// A locally captured track.
///
/// `sample_sink` is set when the capture pipeline feeds samples itself;
/// otherwise the backend allocates a sink when the track is attached.
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    live: Arc<AtomicBool>,
    pub sample_sink: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
            sample_sink: None,
        }
    }

    pub fn with_sample_sink(mut self, sink: Arc<TrackLocalStaticSample>) -> Self {
        self.sample_sink = Some(sink);
        self
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Ends the track; every clone observes the change.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn all_live(&self) -> bool {
        !self.tracks.is_empty() && self.tracks.iter().all(LocalTrack::is_live)
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|track| track.is_live()).count()
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|track| track.kind == MediaKind::Video)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A track announced by the remote side.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub media: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            media: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("has_media", &self.media.is_some())
            .finish()
    }
}

/// One logical inbound stream per remote peer.
///
/// Clones share the track list, so a renderer holding the handle sees
/// tracks that arrive after it was delivered.
#[derive(Clone, Debug)]
pub struct RemoteStream {
    id: String,
    tracks: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds `track` unless a track with the same id is already present.
    pub fn add_track(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|existing| existing.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn track_count(&self, kind: MediaKind) -> usize {
        self.tracks.read().iter().filter(|track| track.kind == kind).count()
    }

    pub fn same_stream(&self, other: &RemoteStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_wire_shape_uses_browser_field_names() {
        let candidate = IceCandidate::new(
            "candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host",
            Some("0"),
            Some(0),
        );
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);

        let parsed: IceCandidate =
            serde_json::from_value(serde_json::json!({ "candidate": "candidate:2", "sdpMLineIndex": 1 }))
                .unwrap();
        assert_eq!(parsed.sdp_mid, None);
        assert_eq!(parsed.sdp_mline_index, Some(1));
    }

    #[test]
    fn malformed_candidates_fail_validation() {
        assert!(IceCandidate::new("", Some("0"), Some(0)).validate().is_err());
        assert!(IceCandidate::new("candidate:1", None, None).validate().is_err());
        assert!(IceCandidate::new("candidate:1", None, Some(0)).validate().is_ok());
    }

    #[test]
    fn remote_stream_accumulates_distinct_tracks() {
        let stream = RemoteStream::new("stream-1");
        let view = stream.clone();
        assert!(stream.add_track(RemoteTrack::new("a1", "stream-1", MediaKind::Audio)));
        assert!(stream.add_track(RemoteTrack::new("v1", "stream-1", MediaKind::Video)));
        assert!(!stream.add_track(RemoteTrack::new("v1", "stream-1", MediaKind::Video)));
        assert_eq!(view.tracks().len(), 2);
        assert!(view.same_stream(&stream));
    }

    #[test]
    fn stopping_a_track_is_visible_through_clones() {
        let track = LocalTrack::new("cam", "local", MediaKind::Video);
        let stream = LocalMediaStream::new("local", vec![track.clone()]);
        assert!(stream.all_live());
        track.stop();
        assert!(!stream.all_live());
        assert_eq!(stream.live_track_count(), 0);
    }
}
