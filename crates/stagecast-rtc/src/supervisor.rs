//! Per-peer timers, attempt bookkeeping and cleanup shared by both roles.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::candidate_buffer::CandidateBuffer;
use crate::config::HandshakeConfig;
use crate::factory::PeerConnectionFactory;
use crate::types::{PeerConnectionState, PeerId};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Where a connection is in the ICE-restart cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartState {
    #[default]
    Idle,
    /// Restart requested, renegotiation not yet applied.
    AwaitingNegotiation,
    /// Restart offer/answer exchanged; the next failure is final.
    Negotiated,
}

#[derive(Debug, Clone, Default)]
pub struct HandshakeAttemptState {
    offer_token: Option<u64>,
    pub reconnect_attempts: u32,
    pub last_connection_time: Option<Instant>,
    pub restart: RestartState,
    pub handshake_id: Option<String>,
    pub manual_recovery_notified: bool,
}

impl HandshakeAttemptState {
    pub fn offer_in_progress(&self) -> bool {
        self.offer_token.is_some()
    }
}

type AttemptMap = Arc<Mutex<HashMap<PeerId, HandshakeAttemptState>>>;

/// Marks an offer cycle in flight for one peer until dropped.
pub struct OfferGuard {
    peer_id: PeerId,
    token: u64,
    attempts: AttemptMap,
}

impl OfferGuard {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

impl Drop for OfferGuard {
    fn drop(&mut self) {
        if let Some(state) = self.attempts.lock().get_mut(&self.peer_id) {
            if state.offer_token == Some(self.token) {
                state.offer_token = None;
            }
        }
    }
}

impl std::fmt::Debug for OfferGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferGuard")
            .field("peer_id", &self.peer_id)
            .field("token", &self.token)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectionTimeout,
    Reconnect,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Connected,
    Failed,
    Exhausted,
}

type TimerKey = (PeerId, TimerKind);

struct TimerSlot {
    id: u64,
    handle: JoinHandle<()>,
}

type TimerMap = Arc<Mutex<HashMap<TimerKey, TimerSlot>>>;

/// Handed to a timer task so it can take itself out of the table before
/// running its action. An action that cancels its own peer's timers then
/// cannot abort the task it runs in.
struct TimerTicket {
    timers: TimerMap,
    key: TimerKey,
    id: u64,
}

impl TimerTicket {
    fn peer_id(&self) -> &PeerId {
        &self.key.0
    }

    /// False when the slot was cancelled or replaced meanwhile.
    fn detach(&self) -> bool {
        let mut timers = self.timers.lock();
        match timers.get(&self.key) {
            Some(slot) if slot.id == self.id => {
                timers.remove(&self.key);
                true
            }
            _ => false,
        }
    }
}

pub struct LifecycleSupervisor {
    factory: Arc<PeerConnectionFactory>,
    buffer: CandidateBuffer,
    config: HandshakeConfig,
    attempts: AttemptMap,
    timers: TimerMap,
    next_id: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleSupervisor {
    pub fn new(factory: PeerConnectionFactory, config: HandshakeConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            buffer: CandidateBuffer::new(
                config.candidate_buffer_timeout,
                config.max_candidate_retries,
            ),
            config,
            attempts: Arc::new(Mutex::new(HashMap::new())),
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            sweeper: Mutex::new(None),
        }
    }

    pub fn factory(&self) -> &PeerConnectionFactory {
        &self.factory
    }

    pub fn buffer(&self) -> &CandidateBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    fn spawn_timer<F, Fut>(&self, peer_id: &PeerId, kind: TimerKind, body: F)
    where
        F: FnOnce(TimerTicket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = (peer_id.clone(), kind);
        let ticket = TimerTicket {
            timers: Arc::clone(&self.timers),
            key: key.clone(),
            id,
        };
        // The slot must be in place before the task can look for it.
        let mut timers = self.timers.lock();
        let handle = tokio::spawn(body(ticket));
        if let Some(previous) = timers.insert(key, TimerSlot { id, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel(&self, peer_id: &PeerId, kind: TimerKind) -> bool {
        let slot = self.timers.lock().remove(&(peer_id.clone(), kind));
        match slot {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Runs `action` after the connection timeout unless cancelled first or
    /// the connection has been replaced meanwhile.
    pub fn arm_connection_timeout<Fut>(&self, peer_id: &PeerId, generation: u64, action: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timeout = self.config.connection_timeout;
        let factory = Arc::clone(&self.factory);
        self.spawn_timer(peer_id, TimerKind::ConnectionTimeout, move |ticket| async move {
            tokio::time::sleep(timeout).await;
            if !ticket.detach() {
                return;
            }
            if !factory.is_current(ticket.peer_id(), generation) {
                tracing::debug!(
                    target = "webrtc",
                    peer_id = %ticket.peer_id(),
                    generation,
                    "stale connection timeout ignored"
                );
                return;
            }
            tracing::warn!(
                target = "webrtc",
                peer_id = %ticket.peer_id(),
                generation,
                timeout_ms = timeout.as_millis() as u64,
                "connection timed out"
            );
            action.await;
        });
    }

    pub fn cancel_connection_timeout(&self, peer_id: &PeerId) -> bool {
        self.cancel(peer_id, TimerKind::ConnectionTimeout)
    }

    pub fn schedule_reconnect<Fut>(&self, peer_id: &PeerId, delay: Duration, action: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(
            target = "webrtc",
            peer_id = %peer_id,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.spawn_timer(peer_id, TimerKind::Reconnect, move |ticket| async move {
            tokio::time::sleep(delay).await;
            if ticket.detach() {
                action.await;
            }
        });
    }

    pub fn cancel_reconnect(&self, peer_id: &PeerId) -> bool {
        self.cancel(peer_id, TimerKind::Reconnect)
    }

    /// Calls `probe` every poll interval until it reports an outcome or the
    /// connection timeout's worth of polls is spent, then hands the outcome
    /// to `finish`. Stops silently once the connection is replaced.
    pub fn start_polling<P, F>(&self, peer_id: &PeerId, generation: u64, probe: P, finish: F)
    where
        P: Fn() -> Option<PollOutcome> + Send + 'static,
        F: FnOnce(PollOutcome) -> BoxFuture + Send + 'static,
    {
        let interval = self.config.poll_interval;
        let max_polls = self.config.max_polls();
        let factory = Arc::clone(&self.factory);
        self.spawn_timer(peer_id, TimerKind::Poll, move |ticket| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut polls = 0u32;
            let outcome = loop {
                ticker.tick().await;
                if !factory.is_current(ticket.peer_id(), generation) {
                    ticket.detach();
                    return;
                }
                polls += 1;
                if let Some(outcome) = probe() {
                    break outcome;
                }
                if polls >= max_polls {
                    break PollOutcome::Exhausted;
                }
            };
            tracing::debug!(
                target = "webrtc",
                peer_id = %ticket.peer_id(),
                generation,
                polls,
                outcome = ?outcome,
                "establishment poll finished"
            );
            if ticket.detach() {
                finish(outcome).await;
            }
        });
    }

    pub fn is_polling(&self, peer_id: &PeerId) -> bool {
        self.timers
            .lock()
            .contains_key(&(peer_id.clone(), TimerKind::Poll))
    }

    pub fn stop_polling(&self, peer_id: &PeerId) -> bool {
        self.cancel(peer_id, TimerKind::Poll)
    }

    pub fn pending_timers(&self, peer_id: &PeerId) -> Vec<TimerKind> {
        let mut kinds: Vec<TimerKind> = self
            .timers
            .lock()
            .keys()
            .filter(|(peer, _)| peer == peer_id)
            .map(|(_, kind)| *kind)
            .collect();
        kinds.sort_by_key(|kind| *kind as u8);
        kinds
    }

    pub fn cancel_timers(&self, peer_id: &PeerId) {
        let cancelled: Vec<TimerSlot> = {
            let mut timers = self.timers.lock();
            let keys: Vec<TimerKey> = timers
                .keys()
                .filter(|(peer, _)| peer == peer_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| timers.remove(key)).collect()
        };
        for slot in cancelled {
            slot.handle.abort();
        }
    }

    /// Marks an offer cycle in flight, or returns `None` if one already is.
    pub fn try_begin_offer(&self, peer_id: &PeerId) -> Option<OfferGuard> {
        let token = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut attempts = self.attempts.lock();
        let state = attempts.entry(peer_id.clone()).or_default();
        if state.offer_in_progress() {
            return None;
        }
        state.offer_token = Some(token);
        Some(OfferGuard {
            peer_id: peer_id.clone(),
            token,
            attempts: Arc::clone(&self.attempts),
        })
    }

    pub fn attempt(&self, peer_id: &PeerId) -> HandshakeAttemptState {
        self.attempts
            .lock()
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_attempt<R>(
        &self,
        peer_id: &PeerId,
        update: impl FnOnce(&mut HandshakeAttemptState) -> R,
    ) -> R {
        let mut attempts = self.attempts.lock();
        update(attempts.entry(peer_id.clone()).or_default())
    }

    pub fn forget(&self, peer_id: &PeerId) {
        self.attempts.lock().remove(peer_id);
    }

    /// Cancels timers, closes and discards the connection, and drops any
    /// buffered candidates. Attempt counters survive.
    pub async fn cleanup(&self, peer_id: &PeerId) -> bool {
        self.cancel_timers(peer_id);
        let removed = self.factory.remove(peer_id).await;
        let discarded = self.buffer.clear(peer_id);
        tracing::debug!(
            target = "webrtc",
            peer_id = %peer_id,
            generation = removed.as_ref().map(|handle| handle.generation),
            discarded_candidates = discarded,
            "peer cleaned up"
        );
        removed.is_some()
    }

    /// Force-cleans connections stuck in ICE checking or connecting for
    /// longer than the staleness window.
    pub async fn sweep_stuck_connections(&self) -> Vec<PeerId> {
        let window = self.config.stuck_connection_window;
        let stuck: Vec<(PeerId, u64)> = self
            .factory
            .tracked()
            .into_iter()
            .filter(|snapshot| {
                (snapshot.ice_state.is_pending()
                    || snapshot.connection_state == PeerConnectionState::Connecting)
                    && snapshot.since_transition > window
            })
            .map(|snapshot| (snapshot.peer_id, snapshot.generation))
            .collect();

        let mut swept = Vec::with_capacity(stuck.len());
        for (peer_id, generation) in stuck {
            if !self.factory.is_current(&peer_id, generation) {
                continue;
            }
            tracing::warn!(
                target = "webrtc",
                peer_id = %peer_id,
                generation,
                window_ms = window.as_millis() as u64,
                "sweeping stuck connection"
            );
            self.cleanup(&peer_id).await;
            swept.push(peer_id);
        }
        swept
    }

    /// Sweeps every `sweep_interval` until the supervisor is dropped.
    pub fn spawn_sweeper<F>(self: &Arc<Self>, on_swept: F)
    where
        F: Fn(&PeerId) + Send + Sync + 'static,
    {
        let interval = self.config.sweep_interval;
        let supervisor: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                for peer_id in supervisor.sweep_stuck_connections().await {
                    on_swept(&peer_id);
                }
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub async fn reset_all(&self) {
        let cancelled: Vec<TimerSlot> = self.timers.lock().drain().map(|(_, slot)| slot).collect();
        for slot in cancelled {
            slot.handle.abort();
        }
        let closed = self.factory.close_all().await;
        self.buffer.clear_all();
        self.attempts.lock().clear();
        tracing::info!(target = "webrtc", closed, "all peers reset");
    }
}

impl Drop for LifecycleSupervisor {
    fn drop(&mut self) {
        for (_, slot) in self.timers.lock().drain() {
            slot.handle.abort();
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}
