//! Participant side: captures local media, offers it to the host and keeps
//! the connection alive through ICE restarts and bounded reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::HandshakeConfig;
use crate::connection::{
    ConnectionBackend, ConnectionEvent, ConnectionEventHandler, OfferOptions,
};
use crate::error::{HandshakeError, HandshakeResult};
use crate::factory::{ConnectionHandle, ConnectionRole, PeerConnectionFactory};
use crate::media::{LocalMediaHandle, MediaDevices};
use crate::notify::SessionObserver;
use crate::signal::{SignalMessage, SignalSender};
use crate::supervisor::{
    BoxFuture, HandshakeAttemptState, LifecycleSupervisor, OfferGuard, PollOutcome, RestartState,
};
use crate::types::{
    IceCandidate, IceConnectionState, LocalMediaStream, PeerConnectionState, PeerId,
    SessionDescription, SignalingState,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OfferPhase {
    #[default]
    Idle,
    ConnectionCreating,
    MediaAcquiring,
    OfferCreating,
    OfferSent,
    AwaitingAnswer,
    Establishing,
    Connected,
    Failed,
}

#[derive(Default)]
struct OfferPeer {
    phase: OfferPhase,
    /// Held from offer creation until the answer is applied.
    pending_offer: Option<OfferGuard>,
    local_stream: Option<LocalMediaStream>,
}

/// Offering role of the handshake, one instance per participant.
#[derive(Clone)]
pub struct OfferingHandshake {
    inner: Arc<OfferingInner>,
}

struct OfferingInner {
    supervisor: LifecycleSupervisor,
    signals: SignalSender,
    media: LocalMediaHandle,
    observer: Arc<dyn SessionObserver>,
    peers: Mutex<HashMap<PeerId, OfferPeer>>,
    media_unavailable_notified: AtomicBool,
    self_ref: Weak<OfferingInner>,
}

impl OfferingHandshake {
    pub fn new(
        config: HandshakeConfig,
        backend: Arc<dyn ConnectionBackend>,
        devices: Arc<dyn MediaDevices>,
        signals: SignalSender,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<OfferingInner>| {
            let handler: Weak<dyn ConnectionEventHandler> = weak.clone();
            let factory = PeerConnectionFactory::new(
                backend,
                config.ice_servers.clone(),
                ConnectionRole::Offering,
                handler,
            );
            OfferingInner {
                supervisor: LifecycleSupervisor::new(factory, config),
                signals,
                media: LocalMediaHandle::new(devices),
                observer,
                peers: Mutex::new(HashMap::new()),
                media_unavailable_notified: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        });
        Self { inner }
    }

    /// Starts an offer cycle towards `host_id` unless one is already in
    /// flight.
    pub async fn on_offer_requested(&self, host_id: &PeerId) -> HandshakeResult<()> {
        self.inner.offer_requested(host_id).await
    }

    pub async fn on_answer_received(
        &self,
        host_id: &PeerId,
        answer: SessionDescription,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        self.inner
            .answer_received(host_id, answer, handshake_id)
            .await
    }

    pub async fn on_candidate_received(
        &self,
        host_id: &PeerId,
        candidate: IceCandidate,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        self.inner
            .candidate_received(host_id, candidate, handshake_id)
            .await
    }

    /// The relay reported the host gone.
    pub async fn on_peer_left(&self, host_id: &PeerId) {
        let had_connection = self.inner.supervisor.factory().get(host_id).is_some();
        self.teardown(host_id).await;
        if had_connection {
            self.inner.observer.on_connection_lost(host_id);
        }
    }

    /// Drops everything held for `host_id` and releases the camera.
    pub async fn teardown(&self, host_id: &PeerId) {
        self.inner.reset_peer(host_id, OfferPhase::Idle).await;
        self.inner.peers.lock().remove(host_id);
        self.inner.supervisor.forget(host_id);
        self.inner.media.release();
        tracing::info!(target = "webrtc", peer_id = %host_id, "offering side torn down");
    }

    pub async fn shutdown(&self) {
        self.inner.peers.lock().clear();
        self.inner.supervisor.reset_all().await;
        self.inner.media.release();
    }

    pub fn phase(&self, host_id: &PeerId) -> OfferPhase {
        self.inner
            .peers
            .lock()
            .get(host_id)
            .map(|peer| peer.phase)
            .unwrap_or_default()
    }

    pub fn attempt(&self, host_id: &PeerId) -> HandshakeAttemptState {
        self.inner.supervisor.attempt(host_id)
    }

    pub fn local_stream(&self, host_id: &PeerId) -> Option<LocalMediaStream> {
        self.inner
            .peers
            .lock()
            .get(host_id)
            .and_then(|peer| peer.local_stream.clone())
    }

    pub fn supervisor(&self) -> &LifecycleSupervisor {
        &self.inner.supervisor
    }
}

impl OfferingInner {
    fn set_phase(&self, peer_id: &PeerId, phase: OfferPhase) {
        let previous = {
            let mut peers = self.peers.lock();
            let peer = peers.entry(peer_id.clone()).or_default();
            std::mem::replace(&mut peer.phase, phase)
        };
        if previous != phase {
            tracing::trace!(
                target = "webrtc",
                peer_id = %peer_id,
                from = ?previous,
                to = ?phase,
                "offer phase"
            );
        }
    }

    async fn offer_requested(&self, host_id: &PeerId) -> HandshakeResult<()> {
        let Some(guard) = self.supervisor.try_begin_offer(host_id) else {
            tracing::debug!(
                target = "webrtc",
                peer_id = %host_id,
                "offer already in flight; request ignored"
            );
            return Ok(());
        };
        self.supervisor.cancel_reconnect(host_id);

        self.set_phase(host_id, OfferPhase::ConnectionCreating);
        let handle = match self.supervisor.factory().get_or_create(host_id).await {
            Ok(handle) => handle,
            Err(err) => {
                self.set_phase(host_id, OfferPhase::Failed);
                return Err(err);
            }
        };

        self.set_phase(host_id, OfferPhase::MediaAcquiring);
        let acquisition = match self.media.ensure_live().await {
            Ok(acquisition) => acquisition,
            Err(err) => {
                if !self.media_unavailable_notified.swap(true, Ordering::SeqCst) {
                    self.observer.on_media_unavailable(&err.to_string());
                }
                self.set_phase(host_id, OfferPhase::Failed);
                return Err(err.into());
            }
        };
        self.media_unavailable_notified.store(false, Ordering::SeqCst);
        if let Some(reason) = &acquisition.newly_degraded {
            self.observer.on_media_degraded(reason);
        }
        let stream = acquisition.stream;

        if let Err(err) = self
            .send_offer(host_id, &handle, Some(&stream), OfferOptions::default())
            .await
        {
            self.set_phase(host_id, OfferPhase::Failed);
            return Err(err);
        }

        if !self.supervisor.factory().is_current(host_id, handle.generation) {
            // Torn down while the offer was in flight.
            return Err(HandshakeError::Closed);
        }
        {
            let mut peers = self.peers.lock();
            let peer = peers.entry(host_id.clone()).or_default();
            peer.phase = OfferPhase::AwaitingAnswer;
            peer.pending_offer = Some(guard);
            peer.local_stream = Some(stream.clone());
        }
        self.supervisor.arm_connection_timeout(
            host_id,
            handle.generation,
            Self::timed_out(self.self_ref.clone(), host_id.clone(), handle.generation),
        );
        self.start_polling(host_id, &handle, stream);
        Ok(())
    }

    /// Attaches `stream` (if given), creates and applies an offer, and sends
    /// it tagged with a fresh handshake id.
    async fn send_offer(
        &self,
        host_id: &PeerId,
        handle: &ConnectionHandle,
        stream: Option<&LocalMediaStream>,
        options: OfferOptions,
    ) -> HandshakeResult<String> {
        let connection = &handle.connection;
        if let Some(stream) = stream {
            let removed = connection.remove_all_senders().await?;
            let mut attached = 0;
            for track in stream.tracks.iter().filter(|track| track.is_live()) {
                connection.add_track(track).await?;
                attached += 1;
            }
            tracing::debug!(
                target = "webrtc",
                peer_id = %host_id,
                stream_id = %stream.id,
                removed,
                attached,
                "local tracks attached"
            );
        }

        self.set_phase(host_id, OfferPhase::OfferCreating);
        let offer = connection.create_offer(options).await?;
        connection.set_local_description(offer.clone()).await?;

        let handshake_id = Uuid::new_v4().to_string();
        self.supervisor.update_attempt(host_id, |state| {
            state.handshake_id = Some(handshake_id.clone());
        });
        self.signals
            .send(
                host_id,
                SignalMessage::Offer {
                    description: offer,
                    handshake_id: Some(handshake_id.clone()),
                },
            )
            .await?;
        self.set_phase(host_id, OfferPhase::OfferSent);
        tracing::info!(
            target = "webrtc",
            peer_id = %host_id,
            generation = handle.generation,
            handshake_id = %handshake_id,
            ice_restart = options.ice_restart,
            "offer sent"
        );
        Ok(handshake_id)
    }

    async fn answer_received(
        &self,
        host_id: &PeerId,
        answer: SessionDescription,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        let Some(handle) = self.supervisor.factory().get(host_id) else {
            tracing::debug!(target = "webrtc", peer_id = %host_id, "answer for unknown peer dropped");
            return Ok(());
        };
        if self.is_superseded(host_id, handshake_id.as_deref()) {
            tracing::debug!(
                target = "webrtc",
                peer_id = %host_id,
                handshake_id = ?handshake_id,
                "answer for superseded handshake dropped"
            );
            return Ok(());
        }
        let state = handle.connection.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::info!(
                target = "webrtc",
                peer_id = %host_id,
                state = %state,
                "answer ignored; no local offer outstanding"
            );
            return Ok(());
        }

        handle.connection.set_remote_description(answer).await?;
        let report = self
            .supervisor
            .buffer()
            .flush(host_id, handle.connection.as_ref())
            .await;

        let (guard, stream) = {
            let mut peers = self.peers.lock();
            let peer = peers.entry(host_id.clone()).or_default();
            peer.phase = OfferPhase::Establishing;
            (peer.pending_offer.take(), peer.local_stream.clone())
        };
        drop(guard);
        self.supervisor.update_attempt(host_id, |state| {
            if state.restart == RestartState::AwaitingNegotiation {
                state.restart = RestartState::Negotiated;
            }
        });
        tracing::info!(
            target = "webrtc",
            peer_id = %host_id,
            generation = handle.generation,
            applied_candidates = report.applied,
            "answer applied"
        );

        if let Some(stream) = stream {
            if !self.supervisor.is_polling(host_id) {
                self.start_polling(host_id, &handle, stream);
            }
        }
        Ok(())
    }

    async fn candidate_received(
        &self,
        host_id: &PeerId,
        candidate: IceCandidate,
        handshake_id: Option<String>,
    ) -> HandshakeResult<()> {
        candidate.validate().map_err(HandshakeError::InvalidSignal)?;
        if self.is_superseded(host_id, handshake_id.as_deref()) {
            tracing::debug!(
                target = "webrtc",
                peer_id = %host_id,
                "candidate for superseded handshake dropped"
            );
            return Ok(());
        }
        let connection = self
            .supervisor
            .factory()
            .get(host_id)
            .map(|handle| handle.connection);
        self.supervisor
            .buffer()
            .try_apply_or_buffer(host_id, candidate, connection.as_ref())
            .await;
        Ok(())
    }

    fn is_superseded(&self, host_id: &PeerId, received: Option<&str>) -> bool {
        match (received, self.supervisor.attempt(host_id).handshake_id) {
            (Some(received), Some(current)) => received != current,
            _ => false,
        }
    }

    fn start_polling(&self, host_id: &PeerId, handle: &ConnectionHandle, stream: LocalMediaStream) {
        let connection = Arc::clone(&handle.connection);
        let probed = stream.clone();
        let weak = self.self_ref.clone();
        let peer_id = host_id.clone();
        let generation = handle.generation;
        self.supervisor.start_polling(
            host_id,
            generation,
            move || {
                if connection.signaling_state() == SignalingState::Closed {
                    return Some(PollOutcome::Failed);
                }
                let flowing = connection.ice_connection_state().is_connected()
                    && connection.connection_state() == PeerConnectionState::Connected
                    && probed.live_track_count() > 0;
                flowing.then_some(PollOutcome::Connected)
            },
            move |outcome| Self::poll_finished(weak, peer_id, generation, stream, outcome),
        );
    }

    fn poll_finished(
        weak: Weak<Self>,
        host_id: PeerId,
        generation: u64,
        stream: LocalMediaStream,
        outcome: PollOutcome,
    ) -> BoxFuture {
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match outcome {
                PollOutcome::Connected => {
                    inner.set_phase(&host_id, OfferPhase::Connected);
                    inner.observer.on_local_stream_ready(&host_id, &stream);
                }
                PollOutcome::Failed => {
                    inner
                        .full_reset(&host_id, generation, "connection closed while establishing")
                        .await;
                }
                PollOutcome::Exhausted => {
                    inner
                        .full_reset(&host_id, generation, "connection never established")
                        .await;
                }
            }
        })
    }

    fn timed_out(weak: Weak<Self>, host_id: PeerId, generation: u64) -> BoxFuture {
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                inner
                    .full_reset(&host_id, generation, "connection timeout")
                    .await;
            }
        })
    }

    fn reconnect(weak: Weak<Self>, host_id: PeerId) -> BoxFuture {
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tracing::info!(
                target = "webrtc",
                peer_id = %host_id,
                attempt = inner.supervisor.attempt(&host_id).reconnect_attempts,
                "reconnecting"
            );
            if let Err(err) = inner.offer_requested(&host_id).await {
                tracing::warn!(
                    target = "webrtc",
                    peer_id = %host_id,
                    error = %err,
                    "reconnect attempt failed"
                );
                if !matches!(err, HandshakeError::Media(_)) {
                    inner.reset_peer(&host_id, OfferPhase::Failed).await;
                    inner.schedule_next_attempt(&host_id);
                }
            }
        })
    }

    fn handle_connected(&self, host_id: &PeerId, generation: u64) {
        self.supervisor.cancel_connection_timeout(host_id);
        self.supervisor.cancel_reconnect(host_id);
        self.supervisor.update_attempt(host_id, |state| {
            state.reconnect_attempts = 0;
            state.restart = RestartState::Idle;
            state.manual_recovery_notified = false;
            state.last_connection_time = Some(Instant::now());
        });
        tracing::info!(
            target = "webrtc",
            peer_id = %host_id,
            generation,
            "connected to host"
        );
        self.observer.on_connection_established(host_id);
    }

    async fn handle_failure(&self, host_id: &PeerId, generation: u64, reason: &'static str) {
        if !self.supervisor.factory().is_current(host_id, generation) {
            return;
        }
        let attempt = self.supervisor.attempt(host_id);
        match attempt.restart {
            RestartState::AwaitingNegotiation => {
                tracing::debug!(
                    target = "webrtc",
                    peer_id = %host_id,
                    reason,
                    "failure while ICE restart pending"
                );
                return;
            }
            RestartState::Idle if attempt.reconnect_attempts == 0 => {
                match self.restart_ice(host_id, generation).await {
                    Ok(()) => return,
                    Err(err) => tracing::warn!(
                        target = "webrtc",
                        peer_id = %host_id,
                        error = %err,
                        "ICE restart not possible"
                    ),
                }
            }
            _ => {}
        }
        self.full_reset(host_id, generation, reason).await;
    }

    /// Renegotiates the existing connection with fresh ICE credentials.
    async fn restart_ice(&self, host_id: &PeerId, generation: u64) -> HandshakeResult<()> {
        let handle = self
            .supervisor
            .factory()
            .get(host_id)
            .ok_or_else(|| HandshakeError::UnknownPeer(host_id.clone()))?;
        let state = handle.connection.signaling_state();
        if state != SignalingState::Stable {
            return Err(HandshakeError::WrongSignalingState {
                operation: "ice_restart",
                state,
            });
        }
        let guard = self
            .supervisor
            .try_begin_offer(host_id)
            .ok_or_else(|| HandshakeError::Negotiation("offer already in flight".into()))?;

        tracing::info!(target = "webrtc", peer_id = %host_id, generation, "attempting ICE restart");
        self.supervisor.update_attempt(host_id, |state| {
            state.restart = RestartState::AwaitingNegotiation;
        });
        let options = OfferOptions {
            ice_restart: true,
            ..OfferOptions::default()
        };
        self.send_offer(host_id, &handle, None, options).await?;
        {
            let mut peers = self.peers.lock();
            let peer = peers.entry(host_id.clone()).or_default();
            peer.phase = OfferPhase::AwaitingAnswer;
            peer.pending_offer = Some(guard);
        }
        self.supervisor.arm_connection_timeout(
            host_id,
            generation,
            Self::timed_out(self.self_ref.clone(), host_id.clone(), generation),
        );
        Ok(())
    }

    /// Discards the connection and schedules the next attempt, or gives up.
    async fn full_reset(&self, host_id: &PeerId, generation: u64, reason: &str) {
        if !self.supervisor.factory().is_current(host_id, generation) {
            tracing::debug!(
                target = "webrtc",
                peer_id = %host_id,
                generation,
                "reset for replaced connection ignored"
            );
            return;
        }
        tracing::warn!(
            target = "webrtc",
            peer_id = %host_id,
            generation,
            reason,
            "resetting connection"
        );
        self.reset_peer(host_id, OfferPhase::Failed).await;
        self.observer.on_connection_lost(host_id);
        self.schedule_next_attempt(host_id);
    }

    fn schedule_next_attempt(&self, host_id: &PeerId) {
        let policy = self.supervisor.config().backoff_policy();
        let (attempts, notify) = self.supervisor.update_attempt(host_id, |state| {
            state.reconnect_attempts += 1;
            state.restart = RestartState::Idle;
            state.handshake_id = None;
            let notify = !policy.allows(state.reconnect_attempts) && !state.manual_recovery_notified;
            if notify {
                state.manual_recovery_notified = true;
            }
            (state.reconnect_attempts, notify)
        });

        if policy.allows(attempts) {
            let delay = policy.delay_for(attempts - 1);
            self.supervisor.schedule_reconnect(
                host_id,
                delay,
                Self::reconnect(self.self_ref.clone(), host_id.clone()),
            );
        } else if notify {
            tracing::error!(
                target = "webrtc",
                peer_id = %host_id,
                attempts,
                "reconnect attempts exhausted; manual recovery needed"
            );
            self.observer.on_manual_recovery_needed(host_id, attempts);
        }
    }

    async fn reset_peer(&self, host_id: &PeerId, phase: OfferPhase) {
        let guard = {
            let mut peers = self.peers.lock();
            peers.get_mut(host_id).and_then(|peer| {
                peer.phase = phase;
                peer.local_stream = None;
                peer.pending_offer.take()
            })
        };
        drop(guard);
        self.supervisor.cleanup(host_id).await;
    }
}

#[async_trait]
impl ConnectionEventHandler for OfferingInner {
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
                    self.handle_failure(peer_id, generation, "ice failed").await;
                }
            }
            ConnectionEvent::ConnectionStateChanged(state) => {
                self.supervisor.factory().touch(peer_id, generation);
                tracing::debug!(target = "webrtc", peer_id = %peer_id, generation, state = ?state, "connection state");
                match state {
                    PeerConnectionState::Connected => self.handle_connected(peer_id, generation),
                    PeerConnectionState::Failed => {
                        self.handle_failure(peer_id, generation, "connection failed")
                            .await
                    }
                    PeerConnectionState::Closed => {
                        self.reset_peer(peer_id, OfferPhase::Idle).await;
                    }
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
                tracing::debug!(
                    target = "webrtc",
                    peer_id = %peer_id,
                    track_id = %track.id,
                    "inbound track ignored on sending side"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use signal_bus::{LocalSignalBus, SignalBus};
    use test_timeout::tokio_timeout_test;
    use tokio::sync::{broadcast, mpsc};

    use crate::connection::PeerConnection;
    use crate::media::MediaError;
    use crate::mock::{MockBackend, MockMediaDevices};
    use crate::notify::{NotificationChannel, SessionNotification};
    use crate::signal::OFFER_EVENT;

    struct Fixture {
        offerer: OfferingHandshake,
        backend: Arc<MockBackend>,
        devices: Arc<MockMediaDevices>,
        host_rx: broadcast::Receiver<signal_bus::SignalEnvelope>,
        notifications: mpsc::UnboundedReceiver<SessionNotification>,
        host: PeerId,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(LocalSignalBus::new());
        let host_rx = bus.subscribe("host-1");
        let backend = MockBackend::new();
        let devices = Arc::new(MockMediaDevices::new());
        let (observer, notifications) = NotificationChannel::new();
        let config = HandshakeConfig::builder()
            .localhost_only()
            .build()
            .expect("config");
        let offerer = OfferingHandshake::new(
            config,
            backend.clone(),
            devices.clone(),
            SignalSender::new(bus, "participant-7"),
            Arc::new(observer),
        );
        Fixture {
            offerer,
            backend,
            devices,
            host_rx,
            notifications,
            host: PeerId::from("host-1"),
        }
    }

    fn offers_sent(rx: &mut broadcast::Receiver<signal_bus::SignalEnvelope>) -> Vec<SignalMessage> {
        let mut offers = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if envelope.event == OFFER_EVENT {
                offers.push(SignalMessage::from_envelope(&envelope).expect("offer"));
            }
        }
        offers
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionNotification>) -> Vec<SessionNotification> {
        let mut seen = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            seen.push(notification);
        }
        seen
    }

    async fn answer(fx: &Fixture) {
        let connection = fx.backend.latest_for(&fx.host).unwrap();
        let handshake_id = fx.offerer.attempt(&fx.host).handshake_id;
        fx.offerer
            .on_answer_received(&fx.host, SessionDescription::answer("v=0 host"), handshake_id)
            .await
            .unwrap();
        assert_eq!(connection.signaling_state(), SignalingState::Stable);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn offer_request_attaches_media_and_sends_tagged_offer() {
        let mut fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();

        let connection = fx.backend.latest_for(&fx.host).unwrap();
        assert_eq!(connection.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(connection.tracks().len(), 1);
        assert_eq!(connection.offers(), vec![OfferOptions::default()]);
        assert_eq!(fx.offerer.phase(&fx.host), OfferPhase::AwaitingAnswer);

        let offers = offers_sent(&mut fx.host_rx);
        assert_eq!(offers.len(), 1);
        let SignalMessage::Offer { handshake_id, .. } = &offers[0] else {
            panic!("expected offer");
        };
        assert_eq!(handshake_id, &fx.offerer.attempt(&fx.host).handshake_id);
        assert!(fx.offerer.attempt(&fx.host).offer_in_progress());
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn second_request_while_in_flight_is_ignored() {
        let mut fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        assert_eq!(fx.backend.created(), 1);
        assert_eq!(offers_sent(&mut fx.host_rx).len(), 1);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn answer_outside_have_local_offer_changes_nothing() {
        let fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        answer(&fx).await;
        assert!(!fx.offerer.attempt(&fx.host).offer_in_progress());
        assert_eq!(fx.offerer.phase(&fx.host), OfferPhase::Establishing);

        let connection = fx.backend.latest_for(&fx.host).unwrap();
        let before = connection.remote_description();
        fx.offerer
            .on_answer_received(&fx.host, SessionDescription::answer("v=0 duplicate"), None)
            .await
            .unwrap();
        assert_eq!(connection.remote_description(), before);
        assert_eq!(connection.signaling_state(), SignalingState::Stable);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn superseded_answer_is_dropped() {
        let fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        fx.offerer
            .on_answer_received(
                &fx.host,
                SessionDescription::answer("v=0 old"),
                Some("an-older-handshake".into()),
            )
            .await
            .unwrap();
        let connection = fx.backend.latest_for(&fx.host).unwrap();
        assert_eq!(connection.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(connection.remote_description().is_none());
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn early_candidates_apply_after_answer() {
        let fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        for n in 1..=2 {
            let candidate = IceCandidate::new(
                format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
                Some("0"),
                Some(0),
            );
            fx.offerer
                .on_candidate_received(&fx.host, candidate, None)
                .await
                .unwrap();
        }
        assert_eq!(fx.offerer.supervisor().buffer().len(&fx.host), 2);
        answer(&fx).await;
        let connection = fx.backend.latest_for(&fx.host).unwrap();
        assert_eq!(connection.applied_candidates().len(), 2);
        assert_eq!(fx.offerer.supervisor().buffer().len(&fx.host), 0);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn connected_poll_reports_local_stream() {
        let mut fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        answer(&fx).await;
        fx.backend.latest_for(&fx.host).unwrap().connect().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fx.offerer.phase(&fx.host), OfferPhase::Connected);
        let seen = drain(&mut fx.notifications);
        assert!(seen.iter().any(|n| matches!(n, SessionNotification::ConnectionEstablished { .. })));
        assert!(seen.iter().any(|n| matches!(n, SessionNotification::LocalStreamReady { .. })));
        assert!(fx.offerer.supervisor().pending_timers(&fx.host).is_empty());
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn first_ice_failure_restarts_on_same_connection() {
        let mut fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        answer(&fx).await;
        let connection = fx.backend.latest_for(&fx.host).unwrap();
        connection.connect().await;
        let first_id = fx.offerer.attempt(&fx.host).handshake_id;
        offers_sent(&mut fx.host_rx);

        connection.fail_ice().await;
        assert_eq!(fx.backend.created(), 1);
        assert_eq!(connection.offers().last().map(|o| o.ice_restart), Some(true));
        assert_eq!(fx.offerer.attempt(&fx.host).restart, RestartState::AwaitingNegotiation);
        assert_ne!(fx.offerer.attempt(&fx.host).handshake_id, first_id);
        assert_eq!(offers_sent(&mut fx.host_rx).len(), 1);
        assert!(!drain(&mut fx.notifications)
            .iter()
            .any(|n| matches!(n, SessionNotification::ConnectionLost { .. })));

        answer(&fx).await;
        assert_eq!(fx.offerer.attempt(&fx.host).restart, RestartState::Negotiated);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn failure_after_negotiated_restart_resets_and_reconnects() {
        let mut fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        answer(&fx).await;
        let first = fx.backend.latest_for(&fx.host).unwrap();
        first.fail_ice().await;
        answer(&fx).await;
        first.fail().await;

        assert!(first.is_closed());
        assert_eq!(fx.offerer.attempt(&fx.host).reconnect_attempts, 1);
        assert!(drain(&mut fx.notifications)
            .iter()
            .any(|n| matches!(n, SessionNotification::ConnectionLost { .. })));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(fx.backend.created(), 2);
        assert_eq!(fx.offerer.phase(&fx.host), OfferPhase::AwaitingAnswer);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn unanswered_offer_times_out_into_reset() {
        let fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        let first = fx.backend.latest_for(&fx.host).unwrap();
        tokio::time::sleep(Duration::from_millis(30_500)).await;
        assert!(first.is_closed());
        assert_eq!(fx.offerer.attempt(&fx.host).reconnect_attempts, 1);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn media_failure_notifies_once() {
        let mut fx = fixture();
        fx.devices.fail_next(10, MediaError::PermissionDenied("blocked".into()));
        let err = fx.offerer.on_offer_requested(&fx.host).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Media(MediaError::Exhausted(_))));
        assert!(fx.offerer.on_offer_requested(&fx.host).await.is_err());

        let unavailable = drain(&mut fx.notifications)
            .into_iter()
            .filter(|n| matches!(n, SessionNotification::MediaUnavailable { .. }))
            .count();
        assert_eq!(unavailable, 1);
        assert!(!fx.offerer.attempt(&fx.host).offer_in_progress());
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn local_candidates_are_sent_with_handshake_id() {
        let mut fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        let connection = fx.backend.latest_for(&fx.host).unwrap();
        let local = IceCandidate::new("candidate:9 1 udp 1 192.0.2.1 9 typ host", Some("0"), Some(0));
        connection.discover_candidate(local).await;

        let mut candidates = Vec::new();
        while let Ok(envelope) = fx.host_rx.try_recv() {
            if let Ok(SignalMessage::Candidate { handshake_id, .. }) =
                SignalMessage::from_envelope(&envelope)
            {
                candidates.push(handshake_id);
            }
        }
        assert_eq!(candidates, vec![fx.offerer.attempt(&fx.host).handshake_id]);
    }

    #[tokio_timeout_test(secs = 5, paused)]
    async fn teardown_releases_everything() {
        let fx = fixture();
        fx.offerer.on_offer_requested(&fx.host).await.unwrap();
        let stream = fx.offerer.local_stream(&fx.host).unwrap();
        fx.offerer.teardown(&fx.host).await;

        assert!(fx.backend.latest_for(&fx.host).unwrap().is_closed());
        assert!(fx.offerer.supervisor().factory().get(&fx.host).is_none());
        assert!(fx.offerer.supervisor().pending_timers(&fx.host).is_empty());
        assert_eq!(stream.live_track_count(), 0);
        assert_eq!(fx.offerer.phase(&fx.host), OfferPhase::Idle);
    }
}
