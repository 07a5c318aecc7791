use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Endpoint name the relay itself uses when it originates a message.
pub const RELAY_ENDPOINT: &str = "relay";

/// Event the relay emits to every remaining endpoint when one leaves.
pub const PEER_LEFT_EVENT: &str = "peer-left";

/// A named event with a JSON payload, addressed from one endpoint to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: String,
    pub to: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl SignalEnvelope {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("no subscriber for endpoint {0}")]
    NoSubscriber(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Relay between named endpoints.
///
/// Delivery is best effort: implementations may reorder or duplicate
/// envelopes, and callers must tolerate both.
pub trait SignalBus: Send + Sync {
    fn subscribe(&self, endpoint: &str) -> broadcast::Receiver<SignalEnvelope>;
    fn publish(&self, envelope: SignalEnvelope) -> BusResult<()>;
}

/// In-memory room relay for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct LocalSignalBus {
    endpoints: parking_lot::RwLock<HashMap<String, broadcast::Sender<SignalEnvelope>>>,
    aliases: parking_lot::RwLock<HashMap<String, String>>,
}

impl LocalSignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes addressed to `alias` (e.g. `"host"`) to `endpoint`.
    pub fn register_alias(&self, alias: impl Into<String>, endpoint: impl Into<String>) {
        self.aliases.write().insert(alias.into(), endpoint.into());
    }

    pub fn resolve(&self, name: &str) -> String {
        self.aliases
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Drop `endpoint` from the room and tell everyone else it left.
    pub fn leave(&self, endpoint: &str) {
        let remaining: Vec<(String, broadcast::Sender<SignalEnvelope>)> = {
            let mut guard = self.endpoints.write();
            guard.remove(endpoint);
            guard
                .iter()
                .map(|(name, sender)| (name.clone(), sender.clone()))
                .collect()
        };
        self.aliases.write().retain(|_, target| target != endpoint);
        for (name, sender) in remaining {
            let notice = SignalEnvelope::new(
                RELAY_ENDPOINT,
                name,
                PEER_LEFT_EVENT,
                serde_json::json!({ "peerId": endpoint }),
            );
            let _ = sender.send(notice);
        }
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn sender_for(&self, endpoint: &str) -> broadcast::Sender<SignalEnvelope> {
        let mut guard = self.endpoints.write();
        guard
            .entry(endpoint.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl SignalBus for LocalSignalBus {
    fn subscribe(&self, endpoint: &str) -> broadcast::Receiver<SignalEnvelope> {
        self.sender_for(endpoint).subscribe()
    }

    fn publish(&self, mut envelope: SignalEnvelope) -> BusResult<()> {
        let target = self.resolve(&envelope.to);
        let sender = {
            let guard = self.endpoints.read();
            guard.get(&target).cloned()
        };
        let sender = sender.ok_or_else(|| BusError::NoSubscriber(target.clone()))?;
        envelope.to = target.clone();
        sender
            .send(envelope)
            .map(|_| ())
            .map_err(|_| BusError::NoSubscriber(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalSignalBus::new();
        let mut host = bus.subscribe("host-1");
        bus.publish(SignalEnvelope::new(
            "participant-7",
            "host-1",
            "offer",
            json!({ "sdp": "v=0", "type": "offer" }),
        ))
        .expect("publish ok");
        let msg = host.recv().await.expect("receive ok");
        assert_eq!(msg.from, "participant-7");
        assert_eq!(msg.event, "offer");
        assert_eq!(msg.payload["type"], "offer");
    }

    #[tokio::test]
    async fn alias_routes_to_registered_endpoint() {
        let bus = LocalSignalBus::new();
        let mut host = bus.subscribe("host-1");
        bus.register_alias("host", "host-1");
        bus.publish(SignalEnvelope::new("p-2", "host", "candidate", json!({})))
            .expect("publish ok");
        let msg = host.recv().await.expect("receive ok");
        assert_eq!(msg.to, "host-1");
    }

    #[test]
    fn publish_without_subscriber_fails() {
        let bus = LocalSignalBus::new();
        let err = bus
            .publish(SignalEnvelope::new("a", "nobody", "offer", Value::Null))
            .unwrap_err();
        assert!(matches!(err, BusError::NoSubscriber(name) if name == "nobody"));
    }

    #[tokio::test]
    async fn leave_notifies_remaining_endpoints() {
        let bus = LocalSignalBus::new();
        let mut host = bus.subscribe("host-1");
        let _participant = bus.subscribe("participant-7");
        bus.register_alias("host", "participant-7");
        bus.leave("participant-7");

        let msg = host.recv().await.expect("peer-left notice");
        assert_eq!(msg.event, PEER_LEFT_EVENT);
        assert_eq!(msg.from, RELAY_ENDPOINT);
        assert_eq!(msg.payload["peerId"], "participant-7");
        assert_eq!(bus.endpoints(), vec!["host-1".to_string()]);
        assert_eq!(bus.resolve("host"), "host");
    }
}
