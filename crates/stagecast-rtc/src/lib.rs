//! Stagecast RTC: peer-connection handshake and lifecycle core.
//!
//! Responsibilities:
//! - offering side: local media acquisition, offers, bounded reconnects
//! - answering side: receive-only answers and one logical stream per participant
//! - ordering remote candidates against remote descriptions
//! - timers, polling and stuck-connection sweeps keyed by connection generation

pub mod answerer;
pub mod candidate_buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod logging;
pub mod media;
pub mod mock;
pub mod notify;
pub mod offerer;
pub mod retry;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod supervisor;
pub mod types;

pub use answerer::AnsweringHandshake;
pub use candidate_buffer::{ApplyOutcome, BufferedCandidate, CandidateBuffer, FlushReport};
pub use config::{ConfigError, HandshakeConfig, IceServer};
pub use connection::{ConnectionBackend, ConnectionEvent, OfferOptions, PeerConnection};
pub use error::{HandshakeError, HandshakeResult};
pub use factory::{ConnectionHandle, ConnectionRole, PeerConnectionFactory};
pub use media::{LocalMediaHandle, MediaDevices, MediaError};
pub use notify::{LoggingObserver, NotificationChannel, SessionNotification, SessionObserver};
pub use offerer::{OfferPhase, OfferingHandshake};
pub use retry::{BackoffPolicy, retry_with_backoff};
pub use rtc::RtcBackend;
pub use session::{HostSession, ParticipantSession};
pub use signal::{SignalMessage, SignalSender};
pub use supervisor::{HandshakeAttemptState, LifecycleSupervisor, PollOutcome, RestartState};
pub use types::{
    IceCandidate, IceConnectionState, LocalMediaStream, LocalTrack, MediaKind, PeerConnectionState,
    PeerId, RemoteStream, RemoteTrack, SessionDescription, SignalingState,
};
