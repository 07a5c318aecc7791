use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::connection::PeerConnection;
use crate::types::{IceCandidate, PeerId};

#[derive(Debug, Clone)]
pub struct BufferedCandidate {
    pub candidate: IceCandidate,
    pub arrived_at: Instant,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub expired: usize,
    pub requeued: usize,
    pub dropped: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        *self == FlushReport::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Buffered,
}

/// Per-peer FIFO of remote candidates that arrived before the connection
/// could take them.
///
/// Every entry leaves the queue exactly once: applied, expired, or dropped
/// after `max_retries` failed re-applications.
pub struct CandidateBuffer {
    timeout: Duration,
    max_retries: u32,
    queues: Mutex<HashMap<PeerId, VecDeque<BufferedCandidate>>>,
}

impl CandidateBuffer {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer(&self, peer_id: &PeerId, candidate: IceCandidate) {
        self.buffer_at(peer_id, candidate, Instant::now());
    }

    pub fn buffer_at(&self, peer_id: &PeerId, candidate: IceCandidate, arrived_at: Instant) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(peer_id.clone()).or_default();
        queue.push_back(BufferedCandidate {
            candidate,
            arrived_at,
            retry_count: 0,
        });
        tracing::trace!(
            target = "webrtc",
            peer_id = %peer_id,
            buffered = queue.len(),
            "candidate buffered"
        );
    }

    /// Applies `candidate` now if the connection can take it, draining
    /// older entries first; buffers it otherwise. Entries that fail again
    /// during that drain stay queued without holding back `candidate`.
    pub async fn try_apply_or_buffer(
        &self,
        peer_id: &PeerId,
        candidate: IceCandidate,
        connection: Option<&Arc<dyn PeerConnection>>,
    ) -> ApplyOutcome {
        let Some(connection) = connection else {
            self.buffer(peer_id, candidate);
            return ApplyOutcome::Buffered;
        };
        if !Self::ready(connection.as_ref()).await {
            self.buffer(peer_id, candidate);
            return ApplyOutcome::Buffered;
        }

        if self.len(peer_id) > 0 {
            self.flush(peer_id, connection.as_ref()).await;
        }

        match connection.add_ice_candidate(candidate.clone()).await {
            Ok(()) => ApplyOutcome::Applied,
            Err(err) => {
                tracing::debug!(
                    target = "webrtc",
                    peer_id = %peer_id,
                    error = %err,
                    "candidate rejected; buffering for retry"
                );
                let mut queues = self.queues.lock();
                queues
                    .entry(peer_id.clone())
                    .or_default()
                    .push_back(BufferedCandidate {
                        candidate,
                        arrived_at: Instant::now(),
                        retry_count: 1,
                    });
                ApplyOutcome::Buffered
            }
        }
    }

    /// Drains the queue for `peer_id` in arrival order.
    pub async fn flush(&self, peer_id: &PeerId, connection: &dyn PeerConnection) -> FlushReport {
        let pending = self.queues.lock().remove(peer_id);
        let Some(pending) = pending else {
            return FlushReport::default();
        };

        let now = Instant::now();
        let mut report = FlushReport::default();
        let mut retry = VecDeque::new();
        for mut entry in pending {
            if now.saturating_duration_since(entry.arrived_at) > self.timeout {
                report.expired += 1;
                continue;
            }
            match connection.add_ice_candidate(entry.candidate.clone()).await {
                Ok(()) => report.applied += 1,
                Err(err) if entry.retry_count < self.max_retries => {
                    entry.retry_count += 1;
                    tracing::debug!(
                        target = "webrtc",
                        peer_id = %peer_id,
                        retry = entry.retry_count,
                        error = %err,
                        "buffered candidate failed; re-queued"
                    );
                    retry.push_back(entry);
                    report.requeued += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        target = "webrtc",
                        peer_id = %peer_id,
                        error = %err,
                        "buffered candidate dropped after retries"
                    );
                    report.dropped += 1;
                }
            }
        }

        if !retry.is_empty() {
            let mut queues = self.queues.lock();
            let queue = queues.entry(peer_id.clone()).or_default();
            while let Some(entry) = retry.pop_back() {
                queue.push_front(entry);
            }
        }

        tracing::debug!(
            target = "webrtc",
            peer_id = %peer_id,
            applied = report.applied,
            expired = report.expired,
            requeued = report.requeued,
            dropped = report.dropped,
            "candidate buffer flushed"
        );
        report
    }

    pub fn len(&self, peer_id: &PeerId) -> usize {
        self.queues.lock().get(peer_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(VecDeque::is_empty)
    }

    pub fn pending(&self, peer_id: &PeerId) -> Vec<BufferedCandidate> {
        self.queues
            .lock()
            .get(peer_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, peer_id: &PeerId) -> usize {
        self.queues.lock().remove(peer_id).map_or(0, |queue| queue.len())
    }

    pub fn clear_all(&self) {
        self.queues.lock().clear();
    }

    async fn ready(connection: &dyn PeerConnection) -> bool {
        connection.signaling_state().accepts_candidates()
            && connection.has_remote_description().await
    }
}
