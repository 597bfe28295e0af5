//! Network statistics sampling
//!
//! Periodically combines session state with transport metrics into a
//! display-ready [`StatsSnapshot`].

mod aggregator;
mod probe;
mod window;

pub use aggregator::{
    spawn_sampler, ConnectionLabel, Health, SamplerHandle, StatsAggregator, StatsSnapshot,
};
pub use probe::{MetricsProbe, TransportMetrics};
pub use window::{ExponentialSmoother, SlidingWindow};
