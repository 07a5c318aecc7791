use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::config::IceServer;
use crate::error::HandshakeResult;
use crate::types::{
    IceCandidate, IceConnectionState, LocalTrack, MediaKind, PeerConnectionState, PeerId,
    RemoteTrack, SessionDescription, SignalingState,
};

/// Everything a peer connection reports back to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    CandidateDiscovered(IceCandidate),
    IceStateChanged(IceConnectionState),
    ConnectionStateChanged(PeerConnectionState),
    SignalingStateChanged(SignalingState),
    TrackReceived(RemoteTrack),
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::CandidateDiscovered(_) => "candidate_discovered",
            ConnectionEvent::IceStateChanged(_) => "ice_state_changed",
            ConnectionEvent::ConnectionStateChanged(_) => "connection_state_changed",
            ConnectionEvent::SignalingStateChanged(_) => "signaling_state_changed",
            ConnectionEvent::TrackReceived(_) => "track_received",
        }
    }
}

#[async_trait]
pub trait ConnectionEventHandler: Send + Sync {
    async fn on_connection_event(&self, peer_id: &PeerId, generation: u64, event: ConnectionEvent);
}

struct Detached;

#[async_trait]
impl ConnectionEventHandler for Detached {
    async fn on_connection_event(&self, _: &PeerId, _: u64, _: ConnectionEvent) {}
}

/// Routes events of one connection to its owner, tagged with the
/// generation the connection was created for.
///
/// Holds the owner weakly so a connection never keeps a torn-down role alive.
#[derive(Clone)]
pub struct EventSink {
    peer_id: PeerId,
    generation: u64,
    handler: Weak<dyn ConnectionEventHandler>,
}

impl EventSink {
    pub fn new(peer_id: PeerId, generation: u64, handler: Weak<dyn ConnectionEventHandler>) -> Self {
        Self {
            peer_id,
            generation,
            handler,
        }
    }

    /// A sink whose events go nowhere.
    pub fn detached(peer_id: PeerId, generation: u64) -> Self {
        let handler: Weak<dyn ConnectionEventHandler> = Weak::<Detached>::new();
        Self::new(peer_id, generation, handler)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn emit(&self, event: ConnectionEvent) {
        let Some(handler) = self.handler.upgrade() else {
            tracing::trace!(
                target = "webrtc",
                peer_id = %self.peer_id,
                generation = self.generation,
                event = event.name(),
                "event dropped; owner gone"
            );
            return;
        };
        handler
            .on_connection_event(&self.peer_id, self.generation, event)
            .await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

/// The negotiation surface of a single peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn connection_state(&self) -> PeerConnectionState;
    async fn has_remote_description(&self) -> bool;
    async fn current_remote_description(&self) -> Option<SessionDescription>;

    async fn add_recvonly_transceiver(&self, kind: MediaKind) -> HandshakeResult<()>;
    async fn create_offer(&self, options: OfferOptions) -> HandshakeResult<SessionDescription>;
    async fn create_answer(&self) -> HandshakeResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> HandshakeResult<()>;
    async fn set_remote_description(&self, description: SessionDescription)
    -> HandshakeResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> HandshakeResult<()>;

    async fn add_track(&self, track: &LocalTrack) -> HandshakeResult<()>;
    /// Detaches every outbound sender; returns how many were removed.
    async fn remove_all_senders(&self) -> HandshakeResult<usize>;
    async fn close(&self) -> HandshakeResult<()>;

    /// Neither failed nor closed.
    fn is_live(&self) -> bool {
        !self.connection_state().is_terminal() && self.signaling_state() != SignalingState::Closed
    }
}

#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: EventSink,
    ) -> HandshakeResult<Arc<dyn PeerConnection>>;
}
