//! Typed view over the relay's named events.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use signal_bus::{PEER_LEFT_EVENT, SignalBus, SignalEnvelope};

use crate::error::{HandshakeError, HandshakeResult};
use crate::retry::{BackoffPolicy, retry_with_backoff};
use crate::types::{IceCandidate, PeerId, SdpType, SessionDescription};

pub const REQUEST_OFFER_EVENT: &str = "request-offer";
pub const OFFER_EVENT: &str = "offer";
pub const ANSWER_EVENT: &str = "answer";
pub const CANDIDATE_EVENT: &str = "candidate";

const SEND_RETRY: BackoffPolicy =
    BackoffPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    RequestOffer,
    Offer {
        description: SessionDescription,
        handshake_id: Option<String>,
    },
    Answer {
        description: SessionDescription,
        handshake_id: Option<String>,
    },
    Candidate {
        candidate: IceCandidate,
        handshake_id: Option<String>,
    },
    PeerLeft {
        peer_id: PeerId,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct DescriptionPayload {
    sdp: String,
    #[serde(rename = "type")]
    kind: SdpType,
    #[serde(rename = "handshakeId", default, skip_serializing_if = "Option::is_none")]
    handshake_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CandidatePayload {
    #[serde(flatten)]
    candidate: IceCandidate,
    #[serde(rename = "handshakeId", default, skip_serializing_if = "Option::is_none")]
    handshake_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerLeftPayload {
    #[serde(rename = "peerId")]
    peer_id: PeerId,
}

impl SignalMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalMessage::RequestOffer => REQUEST_OFFER_EVENT,
            SignalMessage::Offer { .. } => OFFER_EVENT,
            SignalMessage::Answer { .. } => ANSWER_EVENT,
            SignalMessage::Candidate { .. } => CANDIDATE_EVENT,
            SignalMessage::PeerLeft { .. } => PEER_LEFT_EVENT,
        }
    }

    pub fn to_payload(&self) -> Value {
        let payload = match self {
            SignalMessage::RequestOffer => return json!({}),
            SignalMessage::Offer {
                description,
                handshake_id,
            }
            | SignalMessage::Answer {
                description,
                handshake_id,
            } => serde_json::to_value(DescriptionPayload {
                sdp: description.sdp.clone(),
                kind: description.kind,
                handshake_id: handshake_id.clone(),
            }),
            SignalMessage::Candidate {
                candidate,
                handshake_id,
            } => serde_json::to_value(CandidatePayload {
                candidate: candidate.clone(),
                handshake_id: handshake_id.clone(),
            }),
            SignalMessage::PeerLeft { peer_id } => serde_json::to_value(PeerLeftPayload {
                peer_id: peer_id.clone(),
            }),
        };
        payload.unwrap_or(Value::Null)
    }

    /// Decodes and validates an inbound envelope.
    pub fn from_envelope(envelope: &SignalEnvelope) -> HandshakeResult<Self> {
        match envelope.event.as_str() {
            REQUEST_OFFER_EVENT => Ok(SignalMessage::RequestOffer),
            OFFER_EVENT | ANSWER_EVENT => {
                let payload: DescriptionPayload = decode(envelope)?;
                let expected = if envelope.event == OFFER_EVENT {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                if payload.kind != expected {
                    return Err(HandshakeError::InvalidSignal(format!(
                        "{} event carries a {:?} description",
                        envelope.event, payload.kind
                    )));
                }
                if payload.sdp.trim().is_empty() {
                    return Err(HandshakeError::InvalidSignal("empty sdp".into()));
                }
                let description = SessionDescription {
                    kind: payload.kind,
                    sdp: payload.sdp,
                };
                Ok(match expected {
                    SdpType::Offer => SignalMessage::Offer {
                        description,
                        handshake_id: payload.handshake_id,
                    },
                    SdpType::Answer => SignalMessage::Answer {
                        description,
                        handshake_id: payload.handshake_id,
                    },
                })
            }
            CANDIDATE_EVENT => {
                let payload: CandidatePayload = decode(envelope)?;
                payload
                    .candidate
                    .validate()
                    .map_err(HandshakeError::InvalidSignal)?;
                Ok(SignalMessage::Candidate {
                    candidate: payload.candidate,
                    handshake_id: payload.handshake_id,
                })
            }
            PEER_LEFT_EVENT => {
                let payload: PeerLeftPayload = decode(envelope)?;
                Ok(SignalMessage::PeerLeft {
                    peer_id: payload.peer_id,
                })
            }
            other => Err(HandshakeError::InvalidSignal(format!("unknown event {other}"))),
        }
    }
}

fn decode<T: DeserializeOwned>(envelope: &SignalEnvelope) -> HandshakeResult<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|err| {
        HandshakeError::InvalidSignal(format!("malformed {} payload: {err}", envelope.event))
    })
}

/// Publishes typed messages from one local endpoint.
#[derive(Clone)]
pub struct SignalSender {
    bus: Arc<dyn SignalBus>,
    endpoint: String,
}

impl SignalSender {
    pub fn new(bus: Arc<dyn SignalBus>, endpoint: impl Into<String>) -> Self {
        Self {
            bus,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn bus(&self) -> &Arc<dyn SignalBus> {
        &self.bus
    }

    /// Publishes `message`, retrying briefly while the relay has no route
    /// to `to` yet.
    pub async fn send(&self, to: &PeerId, message: SignalMessage) -> HandshakeResult<()> {
        let event = message.event_name();
        let envelope =
            SignalEnvelope::new(&self.endpoint, to.as_str(), event, message.to_payload());
        retry_with_backoff(&SEND_RETRY, |_| {
            let envelope = envelope.clone();
            async move { self.bus.publish(envelope) }
        })
        .await?;
        tracing::trace!(
            target = "webrtc",
            from = %self.endpoint,
            to = %to,
            event,
            "signal sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_bus::{BusError, LocalSignalBus};

    fn envelope(event: &str, payload: Value) -> SignalEnvelope {
        SignalEnvelope::new("participant-7", "host-1", event, payload)
    }

    #[test]
    fn offer_payload_keeps_wire_names() {
        let message = SignalMessage::Offer {
            description: SessionDescription::offer("v=0"),
            handshake_id: Some("h-1".into()),
        };
        let payload = message.to_payload();
        assert_eq!(payload, json!({ "sdp": "v=0", "type": "offer", "handshakeId": "h-1" }));
        let decoded = SignalMessage::from_envelope(&envelope(OFFER_EVENT, payload)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn candidate_payload_is_flat() {
        let message = SignalMessage::Candidate {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host", None, Some(0)),
            handshake_id: None,
        };
        let payload = message.to_payload();
        assert_eq!(payload["sdpMid"], Value::Null);
        assert_eq!(payload["sdpMLineIndex"], 0);
        assert!(payload.get("handshakeId").is_none());
    }

    #[test]
    fn mismatched_description_type_is_rejected() {
        let err = SignalMessage::from_envelope(&envelope(
            ANSWER_EVENT,
            json!({ "sdp": "v=0", "type": "offer" }),
        ))
        .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidSignal(_)));
    }

    #[test]
    fn malformed_payloads_are_invalid_signals() {
        for (event, payload) in [
            (OFFER_EVENT, json!({ "type": "offer" })),
            (CANDIDATE_EVENT, json!({ "candidate": "", "sdpMid": "0" })),
            (CANDIDATE_EVENT, json!({ "candidate": "candidate:1" })),
            ("bogus", json!({})),
        ] {
            let result = SignalMessage::from_envelope(&envelope(event, payload));
            assert!(matches!(result, Err(HandshakeError::InvalidSignal(_))), "{event}");
        }
    }

    #[test]
    fn peer_left_decodes_peer_id() {
        let decoded = SignalMessage::from_envelope(&SignalEnvelope::new(
            signal_bus::RELAY_ENDPOINT,
            "host-1",
            PEER_LEFT_EVENT,
            json!({ "peerId": "participant-7" }),
        ))
        .unwrap();
        assert_eq!(
            decoded,
            SignalMessage::PeerLeft {
                peer_id: PeerId::from("participant-7")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_retries_until_endpoint_exists() {
        let bus = Arc::new(LocalSignalBus::new());
        let sender = SignalSender::new(bus.clone(), "participant-7");

        let late_bus = bus.clone();
        let subscriber = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            late_bus.subscribe("host-1")
        });
        let mut rx = {
            let host = PeerId::from("host-1");
            let send = sender.send(&host, SignalMessage::RequestOffer);
            let (sent, rx) = tokio::join!(send, subscriber);
            sent.unwrap();
            rx.unwrap()
        };
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, REQUEST_OFFER_EVENT);
        assert_eq!(envelope.from, "participant-7");
    }

    #[tokio::test(start_paused = true)]
    async fn send_gives_up_after_retries() {
        let bus = Arc::new(LocalSignalBus::new());
        let sender = SignalSender::new(bus, "participant-7");
        let err = sender
            .send(&PeerId::from("nobody"), SignalMessage::RequestOffer)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Transport(BusError::NoSubscriber(_))));
    }
}
