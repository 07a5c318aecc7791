use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use signal_bus::{LocalSignalBus, SignalBus, SignalEnvelope};
use stagecast_rtc::mock::{MockBackend, MockMediaDevices};
use stagecast_rtc::signal::{ANSWER_EVENT, CANDIDATE_EVENT, OFFER_EVENT, REQUEST_OFFER_EVENT};
use stagecast_rtc::{
    HandshakeConfig, HostSession, IceCandidate, MediaKind, NotificationChannel, OfferPhase,
    ParticipantSession, PeerConnection, PeerId, RemoteTrack, RestartState, SessionNotification,
    SignalingState,
};
use test_timeout::tokio_timeout_test;
use tokio::sync::{broadcast, mpsc};

const HOST: &str = "host-1";
const PARTICIPANT: &str = "participant-7";

fn config() -> HandshakeConfig {
    HandshakeConfig::builder()
        .localhost_only()
        .build()
        .expect("config")
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
        Some("0"),
        Some(0),
    )
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SessionNotification>) -> Vec<SessionNotification> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification);
    }
    seen
}

fn events(rx: &mut broadcast::Receiver<SignalEnvelope>, event: &str) -> Vec<SignalEnvelope> {
    let mut matching = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if envelope.event == event {
            matching.push(envelope);
        }
    }
    matching
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

struct Room {
    bus: Arc<LocalSignalBus>,
    host: HostSession,
    host_backend: Arc<MockBackend>,
    host_events: mpsc::UnboundedReceiver<SessionNotification>,
    participant: ParticipantSession,
    participant_backend: Arc<MockBackend>,
    participant_events: mpsc::UnboundedReceiver<SessionNotification>,
}

fn room() -> Room {
    let bus = Arc::new(LocalSignalBus::new());
    let host_backend = MockBackend::new();
    let (host_observer, host_events) = NotificationChannel::new();
    let host = HostSession::start(
        config(),
        bus.clone(),
        HOST,
        host_backend.clone(),
        Arc::new(host_observer),
    );
    let participant_backend = MockBackend::new();
    let (participant_observer, participant_events) = NotificationChannel::new();
    let participant = ParticipantSession::start(
        config(),
        bus.clone(),
        PARTICIPANT,
        participant_backend.clone(),
        Arc::new(MockMediaDevices::new()),
        Arc::new(participant_observer),
    );
    Room {
        bus,
        host,
        host_backend,
        host_events,
        participant,
        participant_backend,
        participant_events,
    }
}

#[tokio_timeout_test(secs = 10, paused)]
async fn participant_stream_reaches_host() {
    let mut room = room();
    let host_id = PeerId::from(HOST);
    let participant_id = PeerId::from(PARTICIPANT);

    room.host.request_offer(&participant_id).await.unwrap();
    settle().await;

    let offering = room.participant_backend.latest_for(&host_id).unwrap();
    let answering = room.host_backend.latest_for(&participant_id).unwrap();
    assert_eq!(offering.signaling_state(), SignalingState::Stable);
    assert_eq!(answering.signaling_state(), SignalingState::Stable);
    assert!(!offering.tracks().is_empty());
    assert_eq!(answering.transceivers(), vec![MediaKind::Video]);

    offering.discover_candidate(candidate(1)).await;
    answering.discover_candidate(candidate(2)).await;
    settle().await;
    assert_eq!(answering.applied_candidates(), vec![candidate(1)]);
    assert_eq!(offering.applied_candidates(), vec![candidate(2)]);

    answering.connect().await;
    answering
        .deliver_track(RemoteTrack::new("video-1", "local-1", MediaKind::Video))
        .await;
    offering.connect().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        room.participant.handshake().phase(&host_id),
        OfferPhase::Connected
    );
    let participant_seen = drain(&mut room.participant_events);
    assert!(participant_seen
        .iter()
        .any(|n| matches!(n, SessionNotification::LocalStreamReady { .. })));
    let host_seen = drain(&mut room.host_events);
    assert!(host_seen
        .iter()
        .any(|n| matches!(n, SessionNotification::ConnectionEstablished { .. })));
    let ready: Vec<_> = host_seen
        .iter()
        .filter_map(|n| match n {
            SessionNotification::StreamReady { peer_id, stream } => Some((peer_id, stream)),
            _ => None,
        })
        .collect();
    assert_eq!(ready.len(), 1);
    let (peer_id, stream) = ready[0];
    assert_eq!(peer_id, &participant_id);
    assert_eq!(stream.track_count(MediaKind::Video), 1);
    assert_eq!(stream.tracks().len(), 1);
}

#[tokio_timeout_test(secs = 5, paused)]
async fn early_candidates_apply_in_order_once_offer_lands() {
    let room = room();
    let peer = PeerId::from("p-2");
    let _peer_rx = room.bus.subscribe("p-2");

    for n in 1..=3 {
        room.bus
            .publish(SignalEnvelope::new(
                "p-2",
                HOST,
                CANDIDATE_EVENT,
                serde_json::to_value(candidate(n)).unwrap(),
            ))
            .unwrap();
    }
    room.bus
        .publish(SignalEnvelope::new(
            "p-2",
            HOST,
            OFFER_EVENT,
            json!({ "sdp": "v=0\r\no=- 20 1 IN IP4 0.0.0.0\r\ns=-\r\n", "type": "offer" }),
        ))
        .unwrap();
    settle().await;

    let connection = room.host_backend.latest_for(&peer).unwrap();
    assert_eq!(
        connection.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );
    assert_eq!(room.host.handshake().supervisor().buffer().len(&peer), 0);
}

#[tokio_timeout_test(secs = 5, paused)]
async fn candidate_older_than_buffer_timeout_is_discarded() {
    let room = room();
    let peer = PeerId::from("p-3");
    let _peer_rx = room.bus.subscribe("p-3");

    room.bus
        .publish(SignalEnvelope::new(
            "p-3",
            HOST,
            CANDIDATE_EVENT,
            serde_json::to_value(candidate(1)).unwrap(),
        ))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    room.bus
        .publish(SignalEnvelope::new(
            "p-3",
            HOST,
            OFFER_EVENT,
            json!({ "sdp": "v=0\r\no=- 30 1 IN IP4 0.0.0.0\r\ns=-\r\n", "type": "offer" }),
        ))
        .unwrap();
    settle().await;

    let connection = room.host_backend.latest_for(&peer).unwrap();
    assert!(connection.applied_candidates().is_empty());
    assert_eq!(room.host.handshake().supervisor().buffer().len(&peer), 0);
}

#[tokio_timeout_test(secs = 5, paused)]
async fn replayed_answer_leaves_connection_unchanged() {
    let room = room();
    let host_id = PeerId::from(HOST);
    let participant_id = PeerId::from(PARTICIPANT);
    let mut tap = room.bus.subscribe(PARTICIPANT);

    room.host.request_offer(&participant_id).await.unwrap();
    settle().await;
    let answers = events(&mut tap, ANSWER_EVENT);
    assert_eq!(answers.len(), 1);

    let offering = room.participant_backend.latest_for(&host_id).unwrap();
    let before = offering.remote_description();
    room.bus.publish(answers[0].clone()).unwrap();
    settle().await;

    assert_eq!(offering.signaling_state(), SignalingState::Stable);
    assert_eq!(offering.remote_description(), before);
    assert_eq!(room.participant_backend.created(), 1);
}

#[tokio_timeout_test(secs = 5, paused)]
async fn first_ice_failure_renegotiates_in_place() {
    let room = room();
    let host_id = PeerId::from(HOST);
    let participant_id = PeerId::from(PARTICIPANT);

    room.host.request_offer(&participant_id).await.unwrap();
    settle().await;
    let offering = room.participant_backend.latest_for(&host_id).unwrap();
    offering.connect().await;

    offering.fail_ice().await;
    settle().await;

    assert_eq!(offering.offers().last().map(|o| o.ice_restart), Some(true));
    assert_eq!(room.participant_backend.created(), 1);
    assert_eq!(room.host_backend.created(), 1);
    assert_eq!(offering.signaling_state(), SignalingState::Stable);
    assert_eq!(
        room.participant.handshake().attempt(&host_id).restart,
        RestartState::Negotiated
    );
}

#[tokio_timeout_test(secs = 10, paused)]
async fn unanswered_offers_stop_after_bounded_attempts() {
    let bus = Arc::new(LocalSignalBus::new());
    let mut host_rx = bus.subscribe(HOST);
    let backend = MockBackend::new();
    let (observer, mut notifications) = NotificationChannel::new();
    let _participant = ParticipantSession::start(
        config(),
        bus.clone(),
        PARTICIPANT,
        backend.clone(),
        Arc::new(MockMediaDevices::new()),
        Arc::new(observer),
    );

    bus.publish(SignalEnvelope::new(HOST, PARTICIPANT, REQUEST_OFFER_EVENT, json!({})))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(backend.created(), 3);
    assert_eq!(events(&mut host_rx, OFFER_EVENT).len(), 3);
    let manual = drain(&mut notifications)
        .into_iter()
        .filter(|n| matches!(n, SessionNotification::ManualRecoveryNeeded { attempts: 3, .. }))
        .count();
    assert_eq!(manual, 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(backend.created(), 3);
    assert!(drain(&mut notifications)
        .iter()
        .all(|n| !matches!(n, SessionNotification::ManualRecoveryNeeded { .. })));
}

#[tokio_timeout_test(secs = 5, paused)]
async fn repeated_offer_requests_keep_one_connection() {
    let room = room();
    let participant_id = PeerId::from(PARTICIPANT);
    let mut tap = room.bus.subscribe(HOST);

    for _ in 0..3 {
        room.bus
            .publish(SignalEnvelope::new(HOST, PARTICIPANT, REQUEST_OFFER_EVENT, json!({})))
            .unwrap();
    }
    settle().await;

    assert_eq!(room.participant_backend.created(), 1);
    assert_eq!(events(&mut tap, OFFER_EVENT).len(), 1);
    assert_eq!(room.host.handshake().supervisor().factory().len(), 1);
    assert!(room.host_backend.latest_for(&participant_id).is_some());
}

#[tokio_timeout_test(secs = 5, paused)]
async fn leaving_participant_is_cleaned_up_on_host() {
    let mut room = room();
    let participant_id = PeerId::from(PARTICIPANT);

    room.host.request_offer(&participant_id).await.unwrap();
    settle().await;
    let answering = room.host_backend.latest_for(&participant_id).unwrap();

    room.bus.leave(PARTICIPANT);
    settle().await;

    assert!(answering.is_closed());
    assert!(room.host.handshake().supervisor().factory().is_empty());
    assert!(drain(&mut room.host_events)
        .iter()
        .any(|n| matches!(n, SessionNotification::ConnectionLost { .. })));
}
