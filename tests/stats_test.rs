//! Statistics aggregation tests
//!
//! Window averaging, frame smoothing, degraded readings and the sampler task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use relaylobby::config::{SessionConfig, StatsConfig};
use relaylobby::services::local::{
    LocalAuth, LocalMetrics, LocalNetworkRole, LocalRelay, LocalTransport,
};
use relaylobby::services::{PeerId, Services};
use relaylobby::session::SessionOrchestrator;
use relaylobby::stats::{
    spawn_sampler, ConnectionLabel, MetricsProbe, StatsAggregator, TransportMetrics,
};

fn orchestrator_with(config: SessionConfig) -> Arc<SessionOrchestrator> {
    let services = Services {
        auth: Arc::new(LocalAuth::new()),
        relay: Arc::new(LocalRelay::new()),
        transport: Arc::new(LocalTransport::default()),
        role: Arc::new(LocalNetworkRole::new()),
    };
    Arc::new(SessionOrchestrator::new(config, services))
}

fn orchestrator() -> Arc<SessionOrchestrator> {
    orchestrator_with(SessionConfig::default())
}

fn full_metrics(rtt_ms: f32) -> TransportMetrics {
    TransportMetrics {
        rtt_ms: Some(rtt_ms),
        bandwidth_kbs: Some(20.0),
        packet_loss_pct: Some(0.5),
    }
}

fn aggregator_with_probe(metrics: Arc<LocalMetrics>) -> StatsAggregator {
    let probe: Arc<dyn MetricsProbe> = metrics;
    StatsAggregator::new(orchestrator(), Some(probe), &StatsConfig::default())
}

/// Test: Latency window is a FIFO of the last 10 samples
/// Given 5 samples of 1000 ms followed by 10 samples of 0 ms
/// Then old samples drop out one by one and the average reaches 0
#[tokio::test]
async fn test_latency_window_evicts_oldest() {
    let metrics = Arc::new(LocalMetrics::new());
    let mut stats = aggregator_with_probe(metrics.clone());

    let mut averages = Vec::new();
    for i in 0..15 {
        let rtt = if i < 5 { 1000.0 } else { 0.0 };
        metrics.set(full_metrics(rtt));
        averages.push(stats.sample().latency_ms);
    }

    assert_eq!(averages[4], 1000.0);
    // 5 x 1000 + 5 x 0
    assert_eq!(averages[9], 500.0);
    // Sample 11 evicts the first 1000
    assert_eq!(averages[10], 400.0);
    assert_eq!(averages[14], 0.0);
}

/// Test: Missing probe reports zeros and flags the snapshot
#[tokio::test]
async fn test_no_probe_is_degraded() {
    let mut stats = StatsAggregator::new(orchestrator(), None, &StatsConfig::default());

    let snapshot = stats.sample();
    assert!(snapshot.degraded);
    assert_eq!(snapshot.latency_ms, 0.0);
    assert_eq!(snapshot.bandwidth_kbs, 0.0);
    assert_eq!(snapshot.packet_loss_pct, 0.0);
    assert!(snapshot.lines()[2].ends_with("(n/a)"));
}

/// Test: Partially available metrics
/// Given a probe that measures RTT only
/// Then RTT is used and the snapshot is still flagged degraded
#[tokio::test]
async fn test_partial_metrics_are_degraded() {
    let metrics = Arc::new(LocalMetrics::new());
    metrics.set(TransportMetrics {
        rtt_ms: Some(42.0),
        ..TransportMetrics::default()
    });
    let mut stats = aggregator_with_probe(metrics.clone());

    let snapshot = stats.sample();
    assert!(snapshot.degraded);
    assert_eq!(snapshot.latency_ms, 42.0);
    assert_eq!(snapshot.bandwidth_kbs, 0.0);

    metrics.set(full_metrics(42.0));
    let snapshot = stats.sample();
    assert!(!snapshot.degraded);
    assert_eq!(snapshot.packet_loss_pct, 0.5);
}

/// Test: Probe outage does not drag the averages down
/// Given a steady 100 ms RTT, then three ticks without any reading
/// Then those ticks report a degraded 0 and the average is 100 again on recovery
#[tokio::test]
async fn test_probe_outage_stays_out_of_window() {
    let metrics = Arc::new(LocalMetrics::new());
    let mut stats = aggregator_with_probe(metrics.clone());

    metrics.set(full_metrics(100.0));
    assert_eq!(stats.sample().latency_ms, 100.0);

    metrics.set(TransportMetrics::default());
    for _ in 0..3 {
        let snapshot = stats.sample();
        assert!(snapshot.degraded);
        assert_eq!(snapshot.latency_ms, 0.0);
        assert_eq!(snapshot.bandwidth_kbs, 0.0);
    }

    metrics.set(full_metrics(100.0));
    let snapshot = stats.sample();
    assert!(!snapshot.degraded);
    assert_eq!(snapshot.latency_ms, 100.0);
    assert_eq!(snapshot.bandwidth_kbs, 20.0);
}

/// Test: Frame rate follows the smoothed frame time
#[tokio::test]
async fn test_frames_per_second_smoothing() {
    let mut stats = StatsAggregator::new(orchestrator(), None, &StatsConfig::default());
    assert_eq!(stats.frames_per_second(), 0.0);

    // First frame seeds the average
    stats.record_frame(Duration::from_millis(20));
    assert!((stats.frames_per_second() - 50.0).abs() < 0.01);

    // One slow frame moves the average by alpha only
    stats.record_frame(Duration::from_millis(120));
    let expected = 1.0 / (0.020 + (0.120 - 0.020) * 0.1);
    assert!((stats.frames_per_second() - expected).abs() < 0.01);

    // Zero-length frames are ignored
    stats.record_frame(Duration::ZERO);
    assert!((stats.frames_per_second() - expected).abs() < 0.01);

    for _ in 0..200 {
        stats.record_frame(Duration::from_micros(16_667));
    }
    assert!((stats.sample().frames_per_second - 60.0).abs() < 0.1);
}

/// Test: Hiding the panel keeps sampling
#[tokio::test]
async fn test_toggle_does_not_stop_sampling() {
    let metrics = Arc::new(LocalMetrics::new());
    let mut stats = aggregator_with_probe(metrics.clone());
    assert!(stats.is_visible());

    stats.toggle();
    assert!(!stats.is_visible());

    metrics.set(full_metrics(100.0));
    stats.sample();
    metrics.set(full_metrics(0.0));
    assert_eq!(stats.sample().latency_ms, 50.0);

    stats.set_visible(true);
    assert!(stats.is_visible());
}

/// Test: Connection label and player counts follow the session
#[tokio::test]
async fn test_labels_follow_session() {
    let orchestrator = orchestrator();
    let mut stats = StatsAggregator::new(orchestrator.clone(), None, &StatsConfig::default());
    let snapshot = stats.sample();
    assert_eq!(snapshot.connection_label, ConnectionLabel::Disconnected);
    assert_eq!(snapshot.capacity, 7);

    orchestrator.request_host(3).await.unwrap();
    let snapshot = stats.sample();
    assert_eq!(snapshot.connection_label, ConnectionLabel::Host);
    assert_eq!(snapshot.capacity, 3);
    assert_eq!(snapshot.lines()[1], "Players: 0/3");

    orchestrator.disconnect().unwrap();
    let snapshot = stats.sample();
    assert_eq!(snapshot.connection_label, ConnectionLabel::Disconnected);
    assert_eq!(snapshot.capacity, 7);

    // A late peer event must not show players on a closed session
    orchestrator.on_peer_connected(PeerId(3));
    assert_eq!(stats.sample().lines()[1], "Players: 0/7");
}

/// Test: Dedicated server label
#[tokio::test]
async fn test_server_label() {
    let orchestrator = orchestrator_with(SessionConfig {
        dedicated_server: true,
        ..SessionConfig::default()
    });
    orchestrator.request_host(7).await.unwrap();

    let mut stats = StatsAggregator::new(orchestrator, None, &StatsConfig::default());
    assert_eq!(stats.sample().connection_label, ConnectionLabel::Server);
}

/// Test: Participant label
#[tokio::test]
async fn test_participant_label() {
    let relay = LocalRelay::new();
    let build = |relay: LocalRelay| {
        let services = Services {
            auth: Arc::new(LocalAuth::new()),
            relay: Arc::new(relay),
            transport: Arc::new(LocalTransport::default()),
            role: Arc::new(LocalNetworkRole::new()),
        };
        Arc::new(SessionOrchestrator::new(SessionConfig::default(), services))
    };
    let host = build(relay.clone());
    let guest = build(relay);

    let code = host.request_host(7).await.unwrap();
    guest.request_join(&code).await.unwrap();

    let mut stats = StatsAggregator::new(guest, None, &StatsConfig::default());
    assert_eq!(stats.sample().connection_label, ConnectionLabel::Client);
}

/// Test: Sampler publishes snapshots and stops with its handle
#[tokio::test(start_paused = true)]
async fn test_sampler_publishes_until_dropped() {
    let metrics = Arc::new(LocalMetrics::new());
    metrics.set(full_metrics(40.0));
    let aggregator = Arc::new(Mutex::new(aggregator_with_probe(metrics.clone())));

    let (mut snapshots, handle) = spawn_sampler(aggregator, Duration::from_millis(500));

    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow_and_update().latency_ms, 40.0);

    metrics.set(full_metrics(20.0));
    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow_and_update().latency_ms, 30.0);

    drop(handle);
    let closed = tokio::time::timeout(Duration::from_secs(5), snapshots.changed()).await;
    assert!(matches!(closed, Ok(Err(_))));
}
