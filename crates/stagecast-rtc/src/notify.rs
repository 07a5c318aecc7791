use tokio::sync::mpsc;

use crate::types::{LocalMediaStream, PeerId, RemoteStream};

/// Outbound notifications from the handshake core. Every method defaults
/// to a no-op.
pub trait SessionObserver: Send + Sync {
    /// Host side: first track of a peer's logical stream arrived.
    fn on_stream_ready(&self, _peer_id: &PeerId, _stream: &RemoteStream) {}

    /// Participant side: connected with at least one live local track.
    fn on_local_stream_ready(&self, _peer_id: &PeerId, _stream: &LocalMediaStream) {}

    fn on_connection_established(&self, _peer_id: &PeerId) {}

    fn on_connection_lost(&self, _peer_id: &PeerId) {}

    fn on_manual_recovery_needed(&self, _peer_id: &PeerId, _attempts: u32) {}

    fn on_media_degraded(&self, _reason: &str) {}

    fn on_media_unavailable(&self, _reason: &str) {}
}

#[derive(Debug, Clone)]
pub enum SessionNotification {
    StreamReady { peer_id: PeerId, stream: RemoteStream },
    LocalStreamReady { peer_id: PeerId, stream: LocalMediaStream },
    ConnectionEstablished { peer_id: PeerId },
    ConnectionLost { peer_id: PeerId },
    ManualRecoveryNeeded { peer_id: PeerId, attempts: u32 },
    MediaDegraded { reason: String },
    MediaUnavailable { reason: String },
}

/// Forwards every notification into an unbounded channel.
#[derive(Clone)]
pub struct NotificationChannel {
    tx: mpsc::UnboundedSender<SessionNotification>,
}

impl NotificationChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, notification: SessionNotification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!(target = "webrtc", "notification receiver dropped");
        }
    }
}

impl SessionObserver for NotificationChannel {
    fn on_stream_ready(&self, peer_id: &PeerId, stream: &RemoteStream) {
        self.push(SessionNotification::StreamReady {
            peer_id: peer_id.clone(),
            stream: stream.clone(),
        });
    }

    fn on_local_stream_ready(&self, peer_id: &PeerId, stream: &LocalMediaStream) {
        self.push(SessionNotification::LocalStreamReady {
            peer_id: peer_id.clone(),
            stream: stream.clone(),
        });
    }

    fn on_connection_established(&self, peer_id: &PeerId) {
        self.push(SessionNotification::ConnectionEstablished {
            peer_id: peer_id.clone(),
        });
    }

    fn on_connection_lost(&self, peer_id: &PeerId) {
        self.push(SessionNotification::ConnectionLost {
            peer_id: peer_id.clone(),
        });
    }

    fn on_manual_recovery_needed(&self, peer_id: &PeerId, attempts: u32) {
        self.push(SessionNotification::ManualRecoveryNeeded {
            peer_id: peer_id.clone(),
            attempts,
        });
    }

    fn on_media_degraded(&self, reason: &str) {
        self.push(SessionNotification::MediaDegraded {
            reason: reason.to_string(),
        });
    }

    fn on_media_unavailable(&self, reason: &str) {
        self.push(SessionNotification::MediaUnavailable {
            reason: reason.to_string(),
        });
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_stream_ready(&self, peer_id: &PeerId, stream: &RemoteStream) {
        tracing::info!(target = "webrtc", peer_id = %peer_id, stream_id = stream.id(), "remote stream ready");
    }

    fn on_local_stream_ready(&self, peer_id: &PeerId, stream: &LocalMediaStream) {
        tracing::info!(target = "webrtc", peer_id = %peer_id, stream_id = %stream.id, "local stream flowing");
    }

    fn on_connection_established(&self, peer_id: &PeerId) {
        tracing::info!(target = "webrtc", peer_id = %peer_id, "connection established");
    }

    fn on_connection_lost(&self, peer_id: &PeerId) {
        tracing::info!(target = "webrtc", peer_id = %peer_id, "connection lost");
    }

    fn on_manual_recovery_needed(&self, peer_id: &PeerId, attempts: u32) {
        tracing::warn!(target = "webrtc", peer_id = %peer_id, attempts, "manual recovery needed");
    }

    fn on_media_degraded(&self, reason: &str) {
        tracing::warn!(target = "webrtc", reason, "media degraded");
    }

    fn on_media_unavailable(&self, reason: &str) {
        tracing::error!(target = "webrtc", reason, "media unavailable");
    }
}
