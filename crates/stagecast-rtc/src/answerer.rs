//! Host side: answers participant offers with a receive-only connection and
//! folds inbound tracks into one logical stream per participant.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::HandshakeConfig;
use crate::connection::{ConnectionBackend, ConnectionEvent, ConnectionEventHandler};
use crate::error::{HandshakeError, HandshakeResult};
use crate::factory::{ConnectionRole, PeerConnectionFactory};
use crate::notify::SessionObserver;
use crate::signal::{SignalMessage, SignalSender};
use crate::supervisor::{BoxFuture, HandshakeAttemptState, LifecycleSupervisor, RestartState};
use crate::types::{
    IceCandidate, IceConnectionState, PeerConnectionState, PeerId, RemoteStream, RemoteTrack,
    SessionDescription, SignalingState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureCause {
    Connection,
    Timeout,
}

/// Answering role of the handshake, one instance per host.
#[derive(Clone)]
pub struct AnsweringHandshake {
    inner: Arc<AnsweringInner>,
}

struct AnsweringInner {
    supervisor: Arc<LifecycleSupervisor>,
    signals: SignalSender,
    observer: Arc<dyn SessionObserver>,
    /// Logical stream per participant, tagged with the connection
    /// generation it was assembled from.
    streams: Mutex<HashMap<PeerId, (u64, RemoteStream)>>,
    self_ref: Weak<AnsweringInner>,
}

impl AnsweringHandshake {
    pub fn new(
        config: HandshakeConfig,
        backend: Arc<dyn ConnectionBackend>,
        signals: SignalSender,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<AnsweringInner>| {
            let handler: Weak<dyn ConnectionEventHandler> = weak.clone();
            let factory = PeerConnectionFactory::new(
                backend,
                config.ice_servers.clone(),
                ConnectionRole::Answering,
                handler,
            );
            AnsweringInner {
                supervisor: Arc::new(LifecycleSupervisor::new(factory, config)),
                signals,
                observer,
                streams: Mutex::new(HashMap::new()),
                self_ref: weak.clone(),
            }
        });
        Self { inner }
    }

    /// Asks `peer_id` to start a handshake.
    pub async fn request_offer(&self, peer_id: &PeerId) -> HandshakeResult<()> {
        tracing::info!(target = "webrtc", peer_id = %peer_id, "requesting offer");
        self.inner
            .signals
            .send(peer_id, SignalMessage::RequestOffer)
            .await
    }

    pub async fn on_offer_received(
        &self,
        peer_id: &PeerId,
        offer: SessionDescription,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        self.inner.offer_received(peer_id, offer, handshake_id).await
    }

    pub async fn on_candidate_received(
        &self,
        peer_id: &PeerId,
        candidate: IceCandidate,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        self.inner
            .candidate_received(peer_id, candidate, handshake_id)
            .await
    }

    pub async fn on_peer_left(&self, peer_id: &PeerId) {
        let had_stream = self.inner.streams.lock().remove(peer_id).is_some();
        let had_connection = self.inner.supervisor.cleanup(peer_id).await;
        self.inner.supervisor.forget(peer_id);
        tracing::info!(target = "webrtc", peer_id = %peer_id, "participant left");
        if had_connection || had_stream {
            self.inner.observer.on_connection_lost(peer_id);
        }
    }

    /// Periodically force-cleans connections stuck while establishing.
    pub fn spawn_sweeper(&self) {
        let weak = self.inner.self_ref.clone();
        self.inner.supervisor.spawn_sweeper(move |peer_id| {
            if let Some(inner) = weak.upgrade() {
                inner.streams.lock().remove(peer_id);
                inner.observer.on_connection_lost(peer_id);
            }
        });
    }

    pub async fn shutdown(&self) {
        self.inner.streams.lock().clear();
        self.inner.supervisor.reset_all().await;
    }

    pub fn stream(&self, peer_id: &PeerId) -> Option<RemoteStream> {
        self.inner
            .streams
            .lock()
            .get(peer_id)
            .map(|(_, stream)| stream.clone())
    }

    pub fn attempt(&self, peer_id: &PeerId) -> HandshakeAttemptState {
        self.inner.supervisor.attempt(peer_id)
    }

    pub fn supervisor(&self) -> &LifecycleSupervisor {
        &self.inner.supervisor
    }
}

/// Session id from the `o=` line; it stays fixed across renegotiations of
/// one connection.
fn session_id(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o="))?
        .split_whitespace()
        .nth(1)
}

impl AnsweringInner {
    async fn offer_received(
        &self,
        peer_id: &PeerId,
        offer: SessionDescription,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        let Some(_guard) = self.supervisor.try_begin_offer(peer_id) else {
            tracing::debug!(
                target = "webrtc",
                peer_id = %peer_id,
                "offer already being answered; duplicate ignored"
            );
            return Ok(());
        };

        let mut restart_target = None;
        if let Some(existing) = self.supervisor.factory().get(peer_id) {
            let previous = existing.connection.current_remote_description().await;
            if let Some(previous) = previous {
                let attempt = self.supervisor.attempt(peer_id);
                let same_handshake = handshake_id.is_some() && handshake_id == attempt.handshake_id;
                if same_handshake || previous.sdp == offer.sdp {
                    tracing::debug!(
                        target = "webrtc",
                        peer_id = %peer_id,
                        handshake_id = ?handshake_id,
                        "duplicate offer ignored"
                    );
                    return Ok(());
                }
                if session_id(&previous.sdp) != session_id(&offer.sdp) {
                    tracing::info!(
                        target = "webrtc",
                        peer_id = %peer_id,
                        generation = existing.generation,
                        "participant started a new session; replacing connection"
                    );
                    self.drop_connection(peer_id).await;
                } else if attempt.restart == RestartState::AwaitingNegotiation
                    && existing.connection.signaling_state() != SignalingState::Closed
                {
                    // ICE restart renegotiates the failed connection in place.
                    restart_target = Some(existing);
                }
            }
        }

        let handle = match restart_target {
            Some(handle) => handle,
            None => self.supervisor.factory().get_or_create(peer_id).await?,
        };
        let connection = &handle.connection;
        connection.set_remote_description(offer).await?;
        self.supervisor.update_attempt(peer_id, |state| {
            state.handshake_id = handshake_id.clone();
            if state.restart == RestartState::AwaitingNegotiation {
                state.restart = RestartState::Negotiated;
            }
        });
        let report = self
            .supervisor
            .buffer()
            .flush(peer_id, connection.as_ref())
            .await;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.signals
            .send(
                peer_id,
                SignalMessage::Answer {
                    description: answer,
                    handshake_id: handshake_id.clone(),
                },
            )
            .await?;
        self.supervisor.arm_connection_timeout(
            peer_id,
            handle.generation,
            Self::timed_out(self.self_ref.clone(), peer_id.clone(), handle.generation),
        );
        tracing::info!(
            target = "webrtc",
            peer_id = %peer_id,
            generation = handle.generation,
            handshake_id = ?handshake_id,
            applied_candidates = report.applied,
            "answer sent"
        );
        Ok(())
    }

    async fn candidate_received(
        &self,
        peer_id: &PeerId,
        candidate: IceCandidate,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        candidate.validate().map_err(HandshakeError::InvalidSignal)?;
        let current = self.supervisor.attempt(peer_id).handshake_id;
        let connection = match (&handshake_id, &current) {
            (Some(received), Some(current)) if received != current => {
                // Belongs to an offer not applied yet; hold it for that flush.
                tracing::trace!(
                    target = "webrtc",
                    peer_id = %peer_id,
                    handshake_id = %received,
                    "candidate ahead of its offer"
                );
                None
            }
            _ => self
                .supervisor
                .factory()
                .get(peer_id)
                .map(|handle| handle.connection),
        };
        self.supervisor
            .buffer()
            .try_apply_or_buffer(peer_id, candidate, connection.as_ref())
            .await;
        Ok(())
    }

    fn track_received(&self, peer_id: &PeerId, generation: u64, track: RemoteTrack) {
        let (stream, is_new) = {
            let mut streams = self.streams.lock();
            match streams.get(peer_id) {
                Some((tagged, stream)) if *tagged == generation => (stream.clone(), false),
                _ => {
                    let stream = RemoteStream::new(track.stream_id.clone());
                    streams.insert(peer_id.clone(), (generation, stream.clone()));
                    (stream, true)
                }
            }
        };
        let track_id = track.id.clone();
        let added = stream.add_track(track);
        tracing::debug!(
            target = "webrtc",
            peer_id = %peer_id,
            generation,
            track_id = %track_id,
            added,
            tracks = stream.tracks().len(),
            "remote track"
        );
        if is_new {
            self.observer.on_stream_ready(peer_id, &stream);
        }
    }

    fn timed_out(weak: Weak<Self>, peer_id: PeerId, generation: u64) -> BoxFuture {
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                inner
                    .handle_failure(&peer_id, generation, FailureCause::Timeout)
                    .await;
            }
        })
    }

    fn handle_connected(&self, peer_id: &PeerId, generation: u64) {
        self.supervisor.cancel_connection_timeout(peer_id);
        self.supervisor.update_attempt(peer_id, |state| {
            state.reconnect_attempts = 0;
            state.restart = RestartState::Idle;
            state.manual_recovery_notified = false;
            state.last_connection_time = Some(Instant::now());
        });
        tracing::info!(
            target = "webrtc",
            peer_id = %peer_id,
            generation,
            "participant connected"
        );
        self.observer.on_connection_established(peer_id);
    }

    /// The host never re-offers: it either waits for the participant's ICE
    /// restart or drops the connection and waits for a fresh offer.
    async fn handle_failure(&self, peer_id: &PeerId, generation: u64, cause: FailureCause) {
        if !self.supervisor.factory().is_current(peer_id, generation) {
            return;
        }
        let restart = self.supervisor.attempt(peer_id).restart;
        if restart == RestartState::AwaitingNegotiation {
            match cause {
                FailureCause::Connection => {
                    tracing::debug!(
                        target = "webrtc",
                        peer_id = %peer_id,
                        "already waiting for ICE restart offer"
                    );
                }
                FailureCause::Timeout => {
                    tracing::warn!(
                        target = "webrtc",
                        peer_id = %peer_id,
                        generation,
                        "no ICE restart offer arrived"
                    );
                    self.drop_connection(peer_id).await;
                    self.observer.on_connection_lost(peer_id);
                }
            }
            return;
        }

        let policy = self.supervisor.config().backoff_policy();
        let (previous, failures, notify) = self.supervisor.update_attempt(peer_id, |state| {
            let previous = state.reconnect_attempts;
            state.reconnect_attempts += 1;
            let notify = !policy.allows(state.reconnect_attempts) && !state.manual_recovery_notified;
            if notify {
                state.manual_recovery_notified = true;
            }
            (previous, state.reconnect_attempts, notify)
        });

        if previous == 0 && cause == FailureCause::Connection {
            tracing::info!(
                target = "webrtc",
                peer_id = %peer_id,
                generation,
                "connection failed; waiting for ICE restart offer"
            );
            self.supervisor.update_attempt(peer_id, |state| {
                state.restart = RestartState::AwaitingNegotiation;
            });
            self.supervisor.arm_connection_timeout(
                peer_id,
                generation,
                Self::timed_out(self.self_ref.clone(), peer_id.clone(), generation),
            );
        } else {
            tracing::warn!(
                target = "webrtc",
                peer_id = %peer_id,
                generation,
                failures,
                cause = ?cause,
                "dropping connection; waiting for a fresh offer"
            );
            self.drop_connection(peer_id).await;
            self.observer.on_connection_lost(peer_id);
        }

        if notify {
            tracing::error!(
                target = "webrtc",
                peer_id = %peer_id,
                failures,
                "participant keeps failing; manual recovery needed"
            );
            self.observer.on_manual_recovery_needed(peer_id, failures);
        }
    }

    async fn drop_connection(&self, peer_id: &PeerId) {
        self.streams.lock().remove(peer_id);
        self.supervisor.update_attempt(peer_id, |state| {
            state.restart = RestartState::Idle;
        });
        self.supervisor.cleanup(peer_id).await;
    }
}

#[async_trait]
impl ConnectionEventHandler for AnsweringInner {
    async fn on_connection_event(&self, peer_id: &PeerId, generation: u64, event: ConnectionEvent) {
        if !self.supervisor.factory().is_current(peer_id, generation) {
            tracing::trace!(
                target = "webrtc",
                peer_id = %peer_id,
                generation,
                event = event.name(),
                "event from replaced connection ignored"
            );
            return;
        }
        match event {
            ConnectionEvent::CandidateDiscovered(candidate) => {
                let handshake_id = self.supervisor.attempt(peer_id).handshake_id;
                let message = SignalMessage::Candidate {
                    candidate,
                    handshake_id,
                };
                if let Err(err) = self.signals.send(peer_id, message).await {
                    tracing::warn!(
                        target = "webrtc",
                        peer_id = %peer_id,
                        error = %err,
                        "failed to send local candidate"
                    );
                }
            }
            ConnectionEvent::IceStateChanged(state) => {
                self.supervisor.factory().touch(peer_id, generation);
                tracing::debug!(target = "webrtc", peer_id = %peer_id, generation, state = ?state, "ice state");
                if state.is_connected() {
                    self.supervisor.cancel_connection_timeout(peer_id);
                } else if state == IceConnectionState::Failed {
                    self.handle_failure(peer_id, generation, FailureCause::Connection)
                        .await;
                }
            }
            ConnectionEvent::ConnectionStateChanged(state) => {
                self.supervisor.factory().touch(peer_id, generation);
                tracing::debug!(target = "webrtc", peer_id = %peer_id, generation, state = ?state, "connection state");
                match state {
                    PeerConnectionState::Connected => self.handle_connected(peer_id, generation),
                    PeerConnectionState::Failed => {
                        self.handle_failure(peer_id, generation, FailureCause::Connection)
                            .await
                    }
                    PeerConnectionState::Closed => self.drop_connection(peer_id).await,
                    _ => {}
                }
            }
            ConnectionEvent::SignalingStateChanged(state) => {
                self.supervisor.factory().touch(peer_id, generation);
                tracing::debug!(target = "webrtc", peer_id = %peer_id, generation, state = %state, "signaling state");
                if state == SignalingState::Stable {
                    if let Some(handle) = self.supervisor.factory().get(peer_id) {
                        self.supervisor
                            .buffer()
                            .flush(peer_id, handle.connection.as_ref())
                            .await;
                    }
                }
            }
            ConnectionEvent::TrackReceived(track) => {
                self.track_received(peer_id, generation, track);
            }
        }
    }
}
