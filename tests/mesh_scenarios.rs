//! End-to-end scenarios exercising the forwarding, flood-guard, routing,
//! and robust-send paths together rather than in isolation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshline::channel::{ChannelPool, ChannelPoolConfig};
use meshline::codec;
use meshline::config::EngineConfig;
use meshline::forwarder::MeshForwarder;
use meshline::frame::{FrameType, MeshFrame};
use meshline::guard::FloodGuard;
use meshline::init_test_tracing;
use meshline::optimizer::ConnectionOptimizer;
use meshline::robust::{FailureKind, RobustLayer, SendOutcome};
use meshline::router::Router;
use meshline::security::test_double::NoopSecurityProvider;
use meshline::security::SecurityProvider;
use meshline::topology::Topology;
use meshline::transport::test_double::LoopbackTransport;
use meshline::transport::Transport;

fn node(local: &str) -> (Arc<MeshForwarder>, Arc<LoopbackTransport>) {
    init_test_tracing();
    let topology = Arc::new(Topology::new());
    let router = Arc::new(Router::new(topology.clone()));
    let channels = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
    let guard = Arc::new(FloodGuard::default());
    let security: Arc<dyn SecurityProvider> = Arc::new(NoopSecurityProvider::new());
    let transport = Arc::new(LoopbackTransport::new(local));
    let transport_dyn: Arc<dyn Transport> = transport.clone();
    let optimizer = Arc::new(ConnectionOptimizer::new(30));
    let config = EngineConfig::default();
    let forwarder = Arc::new(MeshForwarder::new(
        local.to_string(),
        topology,
        router,
        channels.clone(),
        guard,
        security,
        transport_dyn,
        optimizer,
        &config,
    ));
    (forwarder, transport)
}

#[tokio::test]
async fn duplicate_suppression_across_a_three_node_chain() {
    let (a, _a_transport) = node("a");
    let (b, b_transport) = node("b");
    let (c, _c_transport) = node("c");

    a.peer_connected("b".into());
    b.peer_connected("a".into());
    b.peer_connected("c".into());

    let delivered_at_c = Arc::new(AtomicU32::new(0));
    let counter = delivered_at_c.clone();
    c.on_frame_delivered(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let frame = MeshFrame::new(FrameType::Chat, "a".into(), None, b"hello mesh".to_vec());
    let wire = codec::encode(&frame).unwrap();

    // A delivers directly to B, which relays onward to C.
    b.handle_incoming(&wire, &"a".to_string());
    b.tick().await;
    let (relayed, _targets) = b_transport.sent.lock().pop().expect("b relayed the frame onward");
    c.handle_incoming(&relayed, &"b".to_string());

    // A retries the same broadcast (same frame id); B has already seen it
    // and must not relay it a second time.
    b.handle_incoming(&wire, &"a".to_string());
    b.tick().await;
    assert!(b_transport.sent.lock().is_empty());

    assert_eq!(delivered_at_c.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn emergency_frames_keep_flowing_while_chat_is_rate_limited() {
    let (b, _transport) = node("b");

    let delivered = Arc::new(AtomicU32::new(0));
    let counter = delivered.clone();
    b.on_frame_delivered(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for i in 0..100 {
        let frame = MeshFrame::new(FrameType::Chat, "a".into(), None, format!("msg{i}").into_bytes());
        let wire = codec::encode(&frame).unwrap();
        b.handle_incoming(&wire, &"a".to_string());
    }
    let delivered_chat = delivered.load(Ordering::SeqCst);
    assert!(delivered_chat < 100, "flood guard should have blocked most of the chat burst");
    assert!(b.counters.guard_blocked.load(Ordering::Relaxed) > 0);

    for i in 0..5 {
        let frame = MeshFrame::new(FrameType::EmergencyMedical, "a".into(), None, format!("sos{i}").into_bytes());
        let wire = codec::encode(&frame).unwrap();
        b.handle_incoming(&wire, &"a".to_string());
    }
    assert_eq!(delivered.load(Ordering::SeqCst), delivered_chat + 5);
}

#[tokio::test]
async fn router_routes_around_a_failed_node_and_recovers() {
    let topology = Arc::new(Topology::new());
    topology.add_edge(&"a".into(), &"b".into());
    topology.add_edge(&"a".into(), &"c".into());
    topology.add_edge(&"b".into(), &"d".into());
    topology.add_edge(&"c".into(), &"d".into());
    let router = Router::new(topology);

    router.mark_failed(&"b".into());
    let path = router.find_best_route(&"a".into(), &"d".into(), false).unwrap();
    assert_eq!(path, vec!["a".to_string(), "c".to_string(), "d".to_string()]);

    router.mark_recovered(&"b".into());
    // Both paths are viable again; either is acceptable once recovered.
    let path = router.find_best_route(&"a".into(), &"d".into(), false).unwrap();
    assert!(path.contains(&"b".to_string()) || path.contains(&"c".to_string()));
}

#[tokio::test]
async fn content_repetition_triggers_a_ban_that_silences_further_traffic() {
    let (b, _transport) = node("b");

    let delivered = Arc::new(AtomicU32::new(0));
    let counter = delivered.clone();
    b.on_frame_delivered(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..5 {
        let frame = MeshFrame::new(FrameType::Chat, "x".into(), None, b"same payload".to_vec());
        let wire = codec::encode(&frame).unwrap();
        b.handle_incoming(&wire, &"x".to_string());
    }
    let delivered_before_ban = delivered.load(Ordering::SeqCst);

    // X is now banned; further chat traffic from X never reaches delivery.
    let frame = MeshFrame::new(FrameType::Chat, "x".into(), None, b"a fresh payload".to_vec());
    let wire = codec::encode(&frame).unwrap();
    b.handle_incoming(&wire, &"x".to_string());
    assert_eq!(delivered.load(Ordering::SeqCst), delivered_before_ban);
}

#[tokio::test]
async fn robust_send_reports_partial_success_when_one_peer_is_unreachable() {
    init_test_tracing();
    let channels = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
    let security: Arc<dyn SecurityProvider> = Arc::new(NoopSecurityProvider::new());
    let transport = Arc::new(LoopbackTransport::new("a"));
    let transport_dyn: Arc<dyn Transport> = transport.clone();
    let optimizer = Arc::new(ConnectionOptimizer::new(30));
    let layer = RobustLayer::new(channels.clone(), security, transport_dyn, optimizer);

    for peer in ["b", "d"] {
        channels.on_peer_connected(&peer.to_string());
        transport.connect(peer);
    }
    // "c" never gets a channel, so acquiring one for it fails immediately.

    let frame = MeshFrame::new(FrameType::Chat, "a".into(), None, b"status update".to_vec());
    let outcome = layer
        .robust_send(&frame, &["b".into(), "c".into(), "d".into()], Duration::from_secs(5))
        .await;

    match outcome {
        SendOutcome::PartialSuccess(errors) => {
            assert_eq!(errors.len(), 1);
            assert!(errors.contains_key("c"));
        }
        other => panic!("expected PartialSuccess, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn circuit_breaker_opens_then_allows_a_half_open_probe_after_recovery() {
    init_test_tracing();
    let channels = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
    let security: Arc<dyn SecurityProvider> = Arc::new(NoopSecurityProvider::new());
    let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new("a"));
    let optimizer = Arc::new(ConnectionOptimizer::new(30));
    let layer = RobustLayer::new(channels, security, transport, optimizer);

    let frame = MeshFrame::new(FrameType::Chat, "a".into(), None, b"ping".to_vec());
    // "ghost" is never connected, so acquire fails every time: five
    // straight failures trips the breaker.
    for _ in 0..5 {
        let _ = layer.robust_send(&frame, &["ghost".into()], Duration::from_secs(1)).await;
    }
    assert!(layer.breaker_is_open());

    let outcome = layer.robust_send(&frame, &["ghost".into()], Duration::from_secs(1)).await;
    assert!(
        matches!(outcome, SendOutcome::Failure(FailureKind::SystemUnavailable)),
        "breaker should fail fast without touching transport while still open"
    );

    // Advance past the recovery timeout so the next call is let through as
    // a half-open probe instead of failing fast.
    tokio::time::advance(Duration::from_secs(61)).await;

    let probe_outcome = layer.robust_send(&frame, &["ghost".into()], Duration::from_secs(1)).await;
    assert!(
        matches!(probe_outcome, SendOutcome::Failure(FailureKind::AllPeersUnreachable)),
        "the half-open probe should actually attempt the send, not fail fast"
    );
    // "ghost" is still unreachable, so the probe fails and the breaker
    // re-opens rather than closing.
    assert!(layer.breaker_is_open());
    assert!(layer.breaker_transition_count() >= 2);
}

