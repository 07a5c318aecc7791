//! Binds a handshake role to its relay endpoint.

use std::future::Future;
use std::sync::Arc;

use signal_bus::{SignalBus, SignalEnvelope};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::answerer::AnsweringHandshake;
use crate::config::HandshakeConfig;
use crate::connection::ConnectionBackend;
use crate::error::{HandshakeError, HandshakeResult};
use crate::logging::{self, LogConfig};
use crate::media::MediaDevices;
use crate::notify::SessionObserver;
use crate::offerer::OfferingHandshake;
use crate::signal::{SignalMessage, SignalSender};
use crate::types::PeerId;

/// Participant endpoint: answers `request-offer` with an offer cycle.
pub struct ParticipantSession {
    endpoint: String,
    handshake: OfferingHandshake,
    pump: JoinHandle<()>,
}

impl ParticipantSession {
    pub fn start(
        config: HandshakeConfig,
        bus: Arc<dyn SignalBus>,
        endpoint: impl Into<String>,
        backend: Arc<dyn ConnectionBackend>,
        devices: Arc<dyn MediaDevices>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let endpoint = endpoint.into();
        init_logging(&config.log);
        let rx = bus.subscribe(&endpoint);
        let signals = SignalSender::new(bus, endpoint.clone());
        let handshake = OfferingHandshake::new(config, backend, devices, signals, observer);
        let routed = handshake.clone();
        let pump = spawn_pump(rx, endpoint.clone(), move |envelope| {
            let handshake = routed.clone();
            async move { route_participant(&handshake, envelope).await }
        });
        tracing::info!(target = "webrtc", endpoint = %endpoint, role = "participant", "session started");
        Self {
            endpoint,
            handshake,
            pump,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn handshake(&self) -> &OfferingHandshake {
        &self.handshake
    }

    /// Stops routing signals and tears every connection down.
    pub async fn shutdown(&self) {
        self.pump.abort();
        self.handshake.shutdown().await;
    }
}

impl Drop for ParticipantSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Host endpoint: answers offers and sweeps stuck connections.
pub struct HostSession {
    endpoint: String,
    handshake: AnsweringHandshake,
    pump: JoinHandle<()>,
}

impl HostSession {
    pub fn start(
        config: HandshakeConfig,
        bus: Arc<dyn SignalBus>,
        endpoint: impl Into<String>,
        backend: Arc<dyn ConnectionBackend>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let endpoint = endpoint.into();
        init_logging(&config.log);
        let rx = bus.subscribe(&endpoint);
        let signals = SignalSender::new(bus, endpoint.clone());
        let handshake = AnsweringHandshake::new(config, backend, signals, observer);
        handshake.spawn_sweeper();
        let routed = handshake.clone();
        let pump = spawn_pump(rx, endpoint.clone(), move |envelope| {
            let handshake = routed.clone();
            async move { route_host(&handshake, envelope).await }
        });
        tracing::info!(target = "webrtc", endpoint = %endpoint, role = "host", "session started");
        Self {
            endpoint,
            handshake,
            pump,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn handshake(&self) -> &AnsweringHandshake {
        &self.handshake
    }

    pub async fn request_offer(&self, peer_id: &PeerId) -> HandshakeResult<()> {
        self.handshake.request_offer(peer_id).await
    }

    pub async fn shutdown(&self) {
        self.pump.abort();
        self.handshake.shutdown().await;
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn init_logging(config: &LogConfig) {
    if let Err(err) = logging::init(config) {
        tracing::debug!(target = "webrtc", error = %err, "keeping existing log subscriber");
    }
}

async fn route_participant(
    handshake: &OfferingHandshake,
    envelope: SignalEnvelope,
) -> HandshakeResult<()> {
    let from = PeerId::from(envelope.from.as_str());
    match SignalMessage::from_envelope(&envelope)? {
        SignalMessage::RequestOffer => handshake.on_offer_requested(&from).await,
        SignalMessage::Answer {
            description,
            handshake_id,
        } => {
            handshake
                .on_answer_received(&from, description, handshake_id)
                .await
        }
        SignalMessage::Candidate {
            candidate,
            handshake_id,
        } => {
            handshake
                .on_candidate_received(&from, candidate, handshake_id)
                .await
        }
        SignalMessage::PeerLeft { peer_id } => {
            handshake.on_peer_left(&peer_id).await;
            Ok(())
        }
        SignalMessage::Offer { .. } => Err(HandshakeError::InvalidSignal(
            "participant endpoints do not accept offers".into(),
        )),
    }
}

async fn route_host(handshake: &AnsweringHandshake, envelope: SignalEnvelope) -> HandshakeResult<()> {
    let from = PeerId::from(envelope.from.as_str());
    match SignalMessage::from_envelope(&envelope)? {
        SignalMessage::Offer {
            description,
            handshake_id,
        } => {
            handshake
                .on_offer_received(&from, description, handshake_id)
                .await
        }
        SignalMessage::Candidate {
            candidate,
            handshake_id,
        } => {
            handshake
                .on_candidate_received(&from, candidate, handshake_id)
                .await
        }
        SignalMessage::PeerLeft { peer_id } => {
            handshake.on_peer_left(&peer_id).await;
            Ok(())
        }
        other => Err(HandshakeError::InvalidSignal(format!(
            "host endpoints do not accept {}",
            other.event_name()
        ))),
    }
}

/// Routes envelopes one at a time so per-peer signals keep relay order.
fn spawn_pump<F, Fut>(
    mut rx: broadcast::Receiver<SignalEnvelope>,
    endpoint: String,
    route: F,
) -> JoinHandle<()>
where
    F: Fn(SignalEnvelope) -> Fut + Send + 'static,
    Fut: Future<Output = HandshakeResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let from = envelope.from.clone();
                    let event = envelope.event.clone();
                    if let Err(err) = route(envelope).await {
                        tracing::warn!(
                            target = "webrtc",
                            endpoint = %endpoint,
                            from = %from,
                            event = %event,
                            error = %err,
                            "signal dropped"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "webrtc",
                        endpoint = %endpoint,
                        skipped,
                        "signal pump lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!(target = "webrtc", endpoint = %endpoint, "signal pump stopped");
    })
}
