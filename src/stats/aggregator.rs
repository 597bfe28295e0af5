//! Statistics aggregation
//!
//! Latency and bandwidth are sampled once per interval and averaged over a
//! FIFO window of measured values. Frame time is fed every frame and
//! exponentially smoothed, so the fast signal is not over-smoothed by the
//! slow window.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use super::probe::{MetricsProbe, TransportMetrics};
use super::window::{ExponentialSmoother, SlidingWindow};
use crate::config::StatsConfig;
use crate::services::AuthorityMode;
use crate::session::{Role, SessionOrchestrator, SessionState};

/// Connection status shown in the stats panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionLabel {
    #[default]
    Disconnected,
    Host,
    Client,
    Server,
}

impl ConnectionLabel {
    pub fn from_state(state: &SessionState) -> Self {
        match (state.role, state.authority_mode) {
            (Role::Authority, AuthorityMode::Host) => Self::Host,
            (Role::Authority, AuthorityMode::Server) => Self::Server,
            (Role::Participant, _) => Self::Client,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "Disconnected",
            Self::Host => "Host",
            Self::Client => "Client",
            Self::Server => "Server",
        };
        f.write_str(label)
    }
}

/// Quality grade used for colour coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    Good,
    Fair,
    Poor,
}

/// Display-ready statistics for one sampling tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub connection_label: ConnectionLabel,
    pub peer_count: u32,
    pub capacity: u32,
    /// Window average of round-trip time
    pub latency_ms: f32,
    /// Window average of throughput
    pub bandwidth_kbs: f32,
    pub frames_per_second: f32,
    pub packet_loss_pct: f32,
    /// Some transport metrics were unavailable and reported as zero
    pub degraded: bool,
}

impl StatsSnapshot {
    pub fn latency_health(&self) -> Health {
        if self.latency_ms < 50.0 {
            Health::Good
        } else if self.latency_ms < 100.0 {
            Health::Fair
        } else {
            Health::Poor
        }
    }

    pub fn fps_health(&self) -> Health {
        if self.frames_per_second >= 60.0 {
            Health::Good
        } else if self.frames_per_second >= 30.0 {
            Health::Fair
        } else {
            Health::Poor
        }
    }

    pub fn packet_loss_health(&self) -> Health {
        if self.packet_loss_pct < 1.0 {
            Health::Good
        } else if self.packet_loss_pct < 3.0 {
            Health::Fair
        } else {
            Health::Poor
        }
    }

    /// Panel lines, one per metric
    pub fn lines(&self) -> Vec<String> {
        let marker = if self.degraded { " (n/a)" } else { "" };
        vec![
            format!("Status: {}", self.connection_label),
            format!("Players: {}/{}", self.peer_count, self.capacity),
            format!("Latency: {:.1}ms{}", self.latency_ms, marker),
            format!("Bandwidth: {:.1} KB/s{}", self.bandwidth_kbs, marker),
            format!("FPS: {:.0}", self.frames_per_second),
            format!("Packet Loss: {:.1}%{}", self.packet_loss_pct, marker),
        ]
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines().join("\n"))
    }
}

/// Samples session and transport state into [`StatsSnapshot`]s
pub struct StatsAggregator {
    orchestrator: Arc<SessionOrchestrator>,
    probe: Option<Arc<dyn MetricsProbe>>,
    latency: SlidingWindow,
    bandwidth: SlidingWindow,
    frame_time: ExponentialSmoother,
    visible: bool,
}

impl StatsAggregator {
    pub fn new(
        orchestrator: Arc<SessionOrchestrator>,
        probe: Option<Arc<dyn MetricsProbe>>,
        config: &StatsConfig,
    ) -> Self {
        Self {
            orchestrator,
            probe,
            latency: SlidingWindow::new(config.window_size),
            bandwidth: SlidingWindow::new(config.window_size),
            frame_time: ExponentialSmoother::new(config.smoothing),
            visible: config.visible,
        }
    }

    /// Feed the duration of one rendered frame
    pub fn record_frame(&mut self, delta: Duration) {
        let seconds = delta.as_secs_f32();
        if seconds > 0.0 {
            self.frame_time.update(seconds);
        }
    }

    /// Smoothed frame rate, 0 before any frame was recorded
    pub fn frames_per_second(&self) -> f32 {
        match self.frame_time.value() {
            Some(seconds) if seconds > 0.0 => 1.0 / seconds,
            _ => 0.0,
        }
    }

    /// Take one sample and return the resulting snapshot
    pub fn sample(&mut self) -> StatsSnapshot {
        let state = self.orchestrator.state();
        let (metrics, mut degraded) = match &self.probe {
            Some(probe) => (probe.sample(), false),
            None => (TransportMetrics::default(), true),
        };

        let latency = reading(metrics.rtt_ms, &mut degraded);
        let bandwidth = reading(metrics.bandwidth_kbs, &mut degraded);
        let packet_loss = reading(metrics.packet_loss_pct, &mut degraded);

        let snapshot = StatsSnapshot {
            connection_label: ConnectionLabel::from_state(&state),
            peer_count: state.connected_peer_count,
            capacity: state.capacity,
            latency_ms: windowed(&mut self.latency, latency),
            bandwidth_kbs: windowed(&mut self.bandwidth, bandwidth),
            frames_per_second: self.frames_per_second(),
            packet_loss_pct: packet_loss.unwrap_or(0.0),
            degraded,
        };
        trace!("Stats sample: {:?}", snapshot);
        snapshot
    }

    pub fn toggle(&mut self) {
        self.visible = !self.visible;
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }
}

/// Missing or non-finite readings mark the sample degraded
fn reading(value: Option<f32>, degraded: &mut bool) -> Option<f32> {
    match value {
        Some(v) if v.is_finite() => Some(v.max(0.0)),
        _ => {
            *degraded = true;
            None
        }
    }
}

/// Window average including `value`, or 0 for a tick without a reading
///
/// Missing readings stay out of the window.
fn windowed(window: &mut SlidingWindow, value: Option<f32>) -> f32 {
    match value {
        Some(v) => {
            window.push(v);
            window.average()
        }
        None => 0.0,
    }
}

/// Handle to a running sampler task; the task stops when this is dropped
pub struct SamplerHandle {
    handle: JoinHandle<()>,
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Sample `aggregator` every `period` and publish each snapshot
pub fn spawn_sampler(
    aggregator: Arc<Mutex<StatsAggregator>>,
    period: Duration,
) -> (watch::Receiver<StatsSnapshot>, SamplerHandle) {
    let (tx, rx) = watch::channel(StatsSnapshot::default());

    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let snapshot = aggregator.lock().sample();
            if tx.send(snapshot).is_err() {
                break;
            }
        }
        debug!("Stats sampler stopped");
    });

    (rx, SamplerHandle { handle })
}
