use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::{HandshakeConfig, IceServer};
use crate::connection::{
    ConnectionBackend, ConnectionEvent, EventSink, OfferOptions, PeerConnection,
};
use crate::error::{HandshakeError, HandshakeResult, to_negotiation_error, to_setup_error};
use crate::types::{
    IceCandidate, IceConnectionState, LocalTrack, MediaKind, PeerConnectionState, RemoteTrack,
    SdpType, SessionDescription, SignalingState,
};

fn build_api(setting: SettingEngine) -> HandshakeResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Connections backed by webrtc-rs.
#[derive(Debug, Clone)]
pub struct RtcBackend {
    ice_disconnected_timeout: Duration,
    ice_failed_timeout: Duration,
    ice_keepalive_interval: Duration,
}

impl RtcBackend {
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            ice_disconnected_timeout: config.ice_disconnected_timeout,
            ice_failed_timeout: config.ice_failed_timeout,
            ice_keepalive_interval: config.ice_keepalive_interval,
        }
    }
}

impl Default for RtcBackend {
    fn default() -> Self {
        Self::new(&HandshakeConfig::default())
    }
}

#[async_trait]
impl ConnectionBackend for RtcBackend {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: EventSink,
    ) -> HandshakeResult<Arc<dyn PeerConnection>> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(self.ice_disconnected_timeout),
            Some(self.ice_failed_timeout),
            Some(self.ice_keepalive_interval),
        );
        let api = build_api(setting)?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        tracing::trace!(
            target = "webrtc",
            peer_id = %events.peer_id(),
            generation = events.generation(),
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc_result = api.new_peer_connection(config).await;
        tracing::trace!(
            target = "webrtc",
            peer_id = %events.peer_id(),
            generation = events.generation(),
            await = "api.new_peer_connection",
            state = "end",
            ok = pc_result.is_ok()
        );
        let pc = Arc::new(pc_result.map_err(to_setup_error)?);

        // Callbacks only enqueue; one task per connection delivers events in
        // order and outside webrtc's handler locks.
        let (tx, rx) = mpsc::unbounded_channel();
        wire_callbacks(&pc, tx);
        tokio::spawn(dispatch_events(rx, events));

        Ok(Arc::new(RtcConnection { pc }))
    }
}

async fn dispatch_events(mut rx: mpsc::UnboundedReceiver<ConnectionEvent>, events: EventSink) {
    while let Some(event) = rx.recv().await {
        events.emit(event).await;
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, tx: mpsc::UnboundedSender<ConnectionEvent>) {
    let candidate_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let candidate = from_rtc_candidate(init);
                    let _ = tx.send(ConnectionEvent::CandidateDiscovered(candidate));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "webrtc",
                        error = %err,
                        "local candidate not serializable"
                    );
                }
            }
        })
    }));

    let ice_tx = tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        let tx = ice_tx.clone();
        Box::pin(async move {
            if let Some(state) = map_ice_state(state) {
                let _ = tx.send(ConnectionEvent::IceStateChanged(state));
            }
        })
    }));

    let pc_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let tx = pc_tx.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                let _ = tx.send(ConnectionEvent::ConnectionStateChanged(state));
            }
        })
    }));

    let signaling_tx = tx.clone();
    pc.on_signaling_state_change(Box::new(move |state| {
        let tx = signaling_tx.clone();
        Box::pin(async move {
            if let Some(state) = map_signaling_state(state) {
                let _ = tx.send(ConnectionEvent::SignalingStateChanged(state));
            }
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(kind) = map_codec_type(track.kind()) else {
                return;
            };
            let remote = RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                media: Some(track),
            };
            let _ = tx.send(ConnectionEvent::TrackReceived(remote));
        })
    }));
}

struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state()).unwrap_or(SignalingState::Stable)
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state()).unwrap_or(IceConnectionState::New)
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(PeerConnectionState::New)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn current_remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.and_then(from_rtc_description)
    }

    async fn add_recvonly_transceiver(&self, kind: MediaKind) -> HandshakeResult<()> {
        self.pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(to_setup_error)?;
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> HandshakeResult<SessionDescription> {
        for (wanted, kind) in [
            (options.offer_to_receive_audio, MediaKind::Audio),
            (options.offer_to_receive_video, MediaKind::Video),
        ] {
            if wanted && !self.has_transceiver(kind).await {
                self.add_recvonly_transceiver(kind).await?;
            }
        }
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> HandshakeResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> HandshakeResult<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> HandshakeResult<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> HandshakeResult<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_track(&self, track: &LocalTrack) -> HandshakeResult<()> {
        let sink = match &track.sample_sink {
            Some(sink) => Arc::clone(sink),
            None => Arc::new(TrackLocalStaticSample::new(
                codec_capability(track.kind),
                track.id.clone(),
                track.stream_id.clone(),
            )),
        };
        let local: Arc<dyn TrackLocal + Send + Sync> = sink;
        self.pc.add_track(local).await.map_err(to_setup_error)?;
        Ok(())
    }

    async fn remove_all_senders(&self) -> HandshakeResult<usize> {
        let mut removed = 0;
        for sender in self.pc.get_senders().await {
            if sender.track().await.is_none() {
                continue;
            }
            self.pc
                .remove_track(&sender)
                .await
                .map_err(to_setup_error)?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn close(&self) -> HandshakeResult<()> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

impl RtcConnection {
    async fn has_transceiver(&self, kind: MediaKind) -> bool {
        let wanted = codec_type(kind);
        self.pc
            .get_transceivers()
            .await
            .iter()
            .any(|transceiver| transceiver.kind() == wanted)
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(description: SessionDescription) -> HandshakeResult<RTCSessionDescription> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|err| HandshakeError::InvalidSignal(err.to_string()))
}

fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(description.sdp)),
        _ => None,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn map_codec_type(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn codec_capability(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
    }
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => return None,
    })
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    #[test]
    fn unspecified_states_are_not_reported() {
        assert_eq!(map_signaling_state(RTCSignalingState::Unspecified), None);
        assert_eq!(map_ice_state(RTCIceConnectionState::Unspecified), None);
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            Some(PeerConnectionState::Failed)
        );
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            Some(IceConnectionState::Completed)
        );
    }

    #[test]
    fn candidate_fields_survive_conversion() {
        let candidate = IceCandidate::new(
            "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host",
            Some("0"),
            Some(0),
        );
        let init = to_rtc_candidate(candidate.clone());
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(from_rtc_candidate(init), candidate);
    }

    #[test]
    fn relay_credentials_are_forwarded() {
        let server = to_rtc_ice_server(&IceServer::turn("turn:relay.example:3478", "user", "pass"));
        assert_eq!(server.urls, vec!["turn:relay.example:3478".to_string()]);
        assert_eq!(server.username, "user");
        assert_eq!(server.credential, "pass");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn receive_only_offer_declares_recvonly_video() {
        let backend = RtcBackend::default();
        let connection = backend
            .create_connection(&[], EventSink::detached(PeerId::from("participant-1"), 1))
            .await
            .expect("peer connection");
        connection
            .add_recvonly_transceiver(MediaKind::Video)
            .await
            .expect("transceiver");
        let offer = connection
            .create_offer(OfferOptions::default())
            .await
            .expect("offer");
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        assert_eq!(connection.signaling_state(), SignalingState::Stable);
        connection.close().await.expect("close");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn answer_without_offer_is_rejected() {
        let backend = RtcBackend::default();
        let connection = backend
            .create_connection(&[], EventSink::detached(PeerId::from("participant-2"), 1))
            .await
            .expect("peer connection");
        assert!(!connection.has_remote_description().await);
        assert!(connection.create_answer().await.is_err());
        connection.close().await.expect("close");
    }
}
