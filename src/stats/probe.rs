//! Transport metrics probe

use serde::{Deserialize, Serialize};

/// One reading of the transport's counters
///
/// Fields the transport cannot measure are left as `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportMetrics {
    /// Round-trip time in milliseconds
    pub rtt_ms: Option<f32>,
    /// Combined send/receive throughput in KB/s
    pub bandwidth_kbs: Option<f32>,
    /// Packet loss in percent (0-100)
    pub packet_loss_pct: Option<f32>,
}

/// Source of transport metrics
pub trait MetricsProbe: Send + Sync {
    fn sample(&self) -> TransportMetrics;
}
