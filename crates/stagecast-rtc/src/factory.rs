use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{IceServer, dedupe_ice_servers};
use crate::connection::{ConnectionBackend, ConnectionEventHandler, EventSink, PeerConnection};
use crate::error::HandshakeResult;
use crate::types::{
    IceConnectionState, MediaKind, PeerConnectionState, PeerId, SignalingState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Participant: sends media, never receives.
    Offering,
    /// Host: receive-only video transceiver from construction on.
    Answering,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    pub peer_id: PeerId,
    pub generation: u64,
    pub connection: Arc<dyn PeerConnection>,
}

/// Point-in-time view of one tracked connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub peer_id: PeerId,
    pub generation: u64,
    pub signaling_state: SignalingState,
    pub ice_state: IceConnectionState,
    pub connection_state: PeerConnectionState,
    pub age: Duration,
    pub since_transition: Duration,
}

struct TrackedConnection {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    created_at: Instant,
    last_transition: Instant,
}

/// Owns the single connection per peer.
pub struct PeerConnectionFactory {
    backend: Arc<dyn ConnectionBackend>,
    ice_servers: Vec<IceServer>,
    role: ConnectionRole,
    handler: Weak<dyn ConnectionEventHandler>,
    connections: Mutex<HashMap<PeerId, TrackedConnection>>,
    next_generation: AtomicU64,
    creation_lock: tokio::sync::Mutex<()>,
}

impl PeerConnectionFactory {
    pub fn new(
        backend: Arc<dyn ConnectionBackend>,
        ice_servers: Vec<IceServer>,
        role: ConnectionRole,
        handler: Weak<dyn ConnectionEventHandler>,
    ) -> Self {
        Self {
            backend,
            ice_servers: dedupe_ice_servers(ice_servers),
            role,
            handler,
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            creation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Returns the live connection for `peer_id`, or closes whatever dead
    /// one is tracked and builds a new one.
    pub async fn get_or_create(&self, peer_id: &PeerId) -> HandshakeResult<ConnectionHandle> {
        let _creating = self.creation_lock.lock().await;

        if let Some(existing) = self.get(peer_id) {
            if existing.connection.is_live() {
                return Ok(existing);
            }
            tracing::debug!(
                target = "webrtc",
                peer_id = %peer_id,
                generation = existing.generation,
                state = ?existing.connection.connection_state(),
                "replacing dead connection"
            );
            self.remove_generation(peer_id, existing.generation).await;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = EventSink::new(peer_id.clone(), generation, self.handler.clone());
        let connection = self
            .backend
            .create_connection(&self.ice_servers, events)
            .await?;

        if self.role == ConnectionRole::Answering {
            if let Err(err) = connection.add_recvonly_transceiver(MediaKind::Video).await {
                let _ = connection.close().await;
                return Err(err);
            }
        }

        let now = Instant::now();
        self.connections.lock().insert(
            peer_id.clone(),
            TrackedConnection {
                generation,
                connection: Arc::clone(&connection),
                created_at: now,
                last_transition: now,
            },
        );
        tracing::info!(
            target = "webrtc",
            peer_id = %peer_id,
            generation,
            role = ?self.role,
            servers = self.ice_servers.len(),
            "peer connection created"
        );
        Ok(ConnectionHandle {
            peer_id: peer_id.clone(),
            generation,
            connection,
        })
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<ConnectionHandle> {
        self.connections
            .lock()
            .get(peer_id)
            .map(|tracked| ConnectionHandle {
                peer_id: peer_id.clone(),
                generation: tracked.generation,
                connection: Arc::clone(&tracked.connection),
            })
    }

    pub fn is_current(&self, peer_id: &PeerId, generation: u64) -> bool {
        self.connections
            .lock()
            .get(peer_id)
            .is_some_and(|tracked| tracked.generation == generation)
    }

    /// Records a state transition for the stuck-connection sweep.
    pub fn touch(&self, peer_id: &PeerId, generation: u64) {
        if let Some(tracked) = self.connections.lock().get_mut(peer_id) {
            if tracked.generation == generation {
                tracked.last_transition = Instant::now();
            }
        }
    }

    /// Stops tracking and closes the connection for `peer_id`.
    pub async fn remove(&self, peer_id: &PeerId) -> Option<ConnectionHandle> {
        let removed = self.connections.lock().remove(peer_id);
        let tracked = removed?;
        close_quietly(peer_id, tracked.generation, &tracked.connection).await;
        Some(ConnectionHandle {
            peer_id: peer_id.clone(),
            generation: tracked.generation,
            connection: tracked.connection,
        })
    }

    /// Like [`remove`](Self::remove), but only if `generation` is still current.
    pub async fn remove_generation(&self, peer_id: &PeerId, generation: u64) -> bool {
        let removed = {
            let mut connections = self.connections.lock();
            match connections.get(peer_id) {
                Some(tracked) if tracked.generation == generation => connections.remove(peer_id),
                _ => None,
            }
        };
        match removed {
            Some(tracked) => {
                close_quietly(peer_id, generation, &tracked.connection).await;
                true
            }
            None => false,
        }
    }

    pub fn tracked(&self) -> Vec<ConnectionSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .connections
            .lock()
            .iter()
            .map(|(peer_id, tracked)| ConnectionSnapshot {
                peer_id: peer_id.clone(),
                generation: tracked.generation,
                signaling_state: tracked.connection.signaling_state(),
                ice_state: tracked.connection.ice_connection_state(),
                connection_state: tracked.connection.connection_state(),
                age: now.saturating_duration_since(tracked.created_at),
                since_transition: now.saturating_duration_since(tracked.last_transition),
            })
            .collect();
        snapshots.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close_all(&self) -> usize {
        let drained: Vec<(PeerId, TrackedConnection)> =
            self.connections.lock().drain().collect();
        let count = drained.len();
        for (peer_id, tracked) in drained {
            close_quietly(&peer_id, tracked.generation, &tracked.connection).await;
        }
        count
    }
}

async fn close_quietly(peer_id: &PeerId, generation: u64, connection: &Arc<dyn PeerConnection>) {
    if let Err(err) = connection.close().await {
        tracing::debug!(
            target = "webrtc",
            peer_id = %peer_id,
            generation,
            error = %err,
            "error closing peer connection"
        );
    }
}
