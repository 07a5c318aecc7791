//! In-memory connection backend and capture devices.
//!
//! `MockConnection` follows the W3C signaling rules closely enough that
//! misordered negotiation fails the same way it would against a real
//! connection, while state transitions are driven explicitly by tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::IceServer;
use crate::connection::{
    ConnectionBackend, ConnectionEvent, EventSink, OfferOptions, PeerConnection,
};
use crate::error::{HandshakeError, HandshakeResult};
use crate::media::{MediaConstraints, MediaDevices, MediaError};
use crate::types::{
    IceCandidate, IceConnectionState, LocalMediaStream, LocalTrack, MediaKind,
    PeerConnectionState, PeerId, RemoteTrack, SdpType, SessionDescription, SignalingState,
};

struct MockState {
    signaling: SignalingState,
    ice: IceConnectionState,
    connection: PeerConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    offers: Vec<OfferOptions>,
    tracks: Vec<LocalTrack>,
    transceivers: Vec<MediaKind>,
    fail_candidates: u32,
    descriptions_created: u32,
}

pub struct MockConnection {
    id: u64,
    ice_servers: Vec<IceServer>,
    events: EventSink,
    state: Mutex<MockState>,
}

impl MockConnection {
    pub fn new(id: u64, ice_servers: Vec<IceServer>, events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            id,
            ice_servers,
            events,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                connection: PeerConnectionState::New,
                local_description: None,
                remote_description: None,
                applied_candidates: Vec::new(),
                offers: Vec::new(),
                tracks: Vec::new(),
                transceivers: Vec::new(),
                fail_candidates: 0,
                descriptions_created: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        self.events.peer_id()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn offers(&self) -> Vec<OfferOptions> {
        self.state.lock().offers.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn transceivers(&self) -> Vec<MediaKind> {
        self.state.lock().transceivers.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    /// The next `count` candidate applications fail.
    pub fn fail_next_candidates(&self, count: u32) {
        self.state.lock().fail_candidates = count;
    }

    pub async fn set_ice_state(&self, ice: IceConnectionState) {
        self.state.lock().ice = ice;
        self.events.emit(ConnectionEvent::IceStateChanged(ice)).await;
    }

    pub async fn set_connection_state(&self, connection: PeerConnectionState) {
        self.state.lock().connection = connection;
        self.events
            .emit(ConnectionEvent::ConnectionStateChanged(connection))
            .await;
    }

    /// Reports ICE and the overall connection as established.
    pub async fn connect(&self) {
        self.set_ice_state(IceConnectionState::Checking).await;
        self.set_ice_state(IceConnectionState::Connected).await;
        self.set_connection_state(PeerConnectionState::Connected).await;
    }

    pub async fn fail_ice(&self) {
        self.set_ice_state(IceConnectionState::Failed).await;
    }

    pub async fn fail(&self) {
        self.set_ice_state(IceConnectionState::Failed).await;
        self.set_connection_state(PeerConnectionState::Failed).await;
    }

    pub async fn discover_candidate(&self, candidate: IceCandidate) {
        self.events
            .emit(ConnectionEvent::CandidateDiscovered(candidate))
            .await;
    }

    pub async fn deliver_track(&self, track: RemoteTrack) {
        self.events.emit(ConnectionEvent::TrackReceived(track)).await;
    }

    fn next_sdp(&self, state: &mut MockState, label: &str, restart: bool) -> String {
        state.descriptions_created += 1;
        let mut sdp = format!(
            "v=0\r\no=mock {} {} IN IP4 127.0.0.1\r\ns={label}\r\n",
            self.id, state.descriptions_created
        );
        for track in &state.tracks {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=sendonly\r\n", track.kind));
        }
        for kind in &state.transceivers {
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n"));
        }
        if restart {
            sdp.push_str("a=ice-options:ice-restart\r\n");
        }
        sdp
    }

    fn transition(
        state: &mut MockState,
        operation: &'static str,
        allowed: &[SignalingState],
        next: SignalingState,
    ) -> HandshakeResult<()> {
        if !allowed.contains(&state.signaling) {
            return Err(HandshakeError::WrongSignalingState {
                operation,
                state: state.signaling,
            });
        }
        state.signaling = next;
        Ok(())
    }

    async fn emit_signaling(&self, before: SignalingState) {
        let after = self.signaling_state();
        if after != before {
            self.events
                .emit(ConnectionEvent::SignalingStateChanged(after))
                .await;
        }
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description.is_some()
    }

    async fn current_remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    async fn add_recvonly_transceiver(&self, kind: MediaKind) -> HandshakeResult<()> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(HandshakeError::Closed);
        }
        state.transceivers.push(kind);
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> HandshakeResult<SessionDescription> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(HandshakeError::Closed);
        }
        state.offers.push(options);
        let sdp = self.next_sdp(&mut state, "offer", options.ice_restart);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> HandshakeResult<SessionDescription> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(HandshakeError::WrongSignalingState {
                operation: "create_answer",
                state: state.signaling,
            });
        }
        let sdp = self.next_sdp(&mut state, "answer", false);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> HandshakeResult<()> {
        let before = {
            let mut state = self.state.lock();
            let before = state.signaling;
            match description.kind {
                SdpType::Offer => Self::transition(
                    &mut state,
                    "set_local_offer",
                    &[SignalingState::Stable, SignalingState::HaveLocalOffer],
                    SignalingState::HaveLocalOffer,
                )?,
                SdpType::Answer => Self::transition(
                    &mut state,
                    "set_local_answer",
                    &[SignalingState::HaveRemoteOffer],
                    SignalingState::Stable,
                )?,
            }
            state.local_description = Some(description);
            before
        };
        self.emit_signaling(before).await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> HandshakeResult<()> {
        let before = {
            let mut state = self.state.lock();
            let before = state.signaling;
            match description.kind {
                SdpType::Offer => Self::transition(
                    &mut state,
                    "set_remote_offer",
                    &[SignalingState::Stable, SignalingState::HaveRemoteOffer],
                    SignalingState::HaveRemoteOffer,
                )?,
                SdpType::Answer => Self::transition(
                    &mut state,
                    "set_remote_answer",
                    &[SignalingState::HaveLocalOffer],
                    SignalingState::Stable,
                )?,
            }
            state.remote_description = Some(description);
            before
        };
        self.emit_signaling(before).await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> HandshakeResult<()> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(HandshakeError::Closed);
        }
        if state.remote_description.is_none() {
            return Err(HandshakeError::Negotiation(
                "remote description not set".into(),
            ));
        }
        if state.fail_candidates > 0 {
            state.fail_candidates -= 1;
            return Err(HandshakeError::Negotiation("candidate rejected".into()));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> HandshakeResult<()> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(HandshakeError::Closed);
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn remove_all_senders(&self) -> HandshakeResult<usize> {
        let mut state = self.state.lock();
        let removed = state.tracks.len();
        state.tracks.clear();
        Ok(removed)
    }

    async fn close(&self) -> HandshakeResult<()> {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        state.connection = PeerConnectionState::Closed;
        Ok(())
    }
}

/// Records every connection it hands out.
#[derive(Default)]
pub struct MockBackend {
    next_id: AtomicU64,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connections_for(&self, peer_id: &PeerId) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|connection| connection.peer_id() == peer_id)
            .cloned()
            .collect()
    }

    pub fn latest_for(&self, peer_id: &PeerId) -> Option<Arc<MockConnection>> {
        self.connections_for(peer_id).pop()
    }
}

#[async_trait]
impl ConnectionBackend for MockBackend {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: EventSink,
    ) -> HandshakeResult<Arc<dyn PeerConnection>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = MockConnection::new(id, ice_servers.to_vec(), events);
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

struct DeviceScript {
    failures: VecDeque<MediaError>,
    video_available: bool,
    audio_with_video: bool,
    requests: Vec<MediaConstraints>,
    acquired: u32,
}

/// Capture devices that succeed unless told otherwise.
///
/// A video request yields a single video track; audio is added only for
/// audio-only requests or after `set_audio_with_video(true)`.
pub struct MockMediaDevices {
    script: Mutex<DeviceScript>,
}

impl MockMediaDevices {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(DeviceScript {
                failures: VecDeque::new(),
                video_available: true,
                audio_with_video: false,
                requests: Vec::new(),
                acquired: 0,
            }),
        }
    }

    /// The next `count` requests fail with `error`.
    pub fn fail_next(&self, count: usize, error: MediaError) {
        let mut script = self.script.lock();
        script.failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn set_video_available(&self, available: bool) {
        self.script.lock().video_available = available;
    }

    pub fn set_audio_with_video(&self, enabled: bool) {
        self.script.lock().audio_with_video = enabled;
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.script.lock().requests.clone()
    }
}

impl Default for MockMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        let mut script = self.script.lock();
        script.requests.push(constraints.clone());
        if let Some(error) = script.failures.pop_front() {
            return Err(error);
        }
        if constraints.video.is_some() && !script.video_available {
            return Err(MediaError::NotFound("camera".into()));
        }
        script.acquired += 1;
        let stream_id = format!("local-{}", script.acquired);
        let mut tracks = Vec::new();
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(
                format!("video-{}", script.acquired),
                stream_id.clone(),
                MediaKind::Video,
            ));
        }
        if constraints.audio && (constraints.video.is_none() || script.audio_with_video) {
            tracks.push(LocalTrack::new(
                format!("audio-{}", script.acquired),
                stream_id.clone(),
                MediaKind::Audio,
            ));
        }
        Ok(LocalMediaStream::new(stream_id, tracks))
    }
}
