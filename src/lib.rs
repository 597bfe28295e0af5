//! relaylobby - Relay-backed multiplayer session lifecycle
//!
//! This library sequences host / join / disconnect requests against an
//! identity service, a relay allocation service, a transport binding and a
//! network role, and publishes session state plus a live statistics feed.

pub mod config;
pub mod services;
pub mod session;
pub mod stats;

pub use config::{AppConfig, SessionConfig, StatsConfig};
pub use services::Services;
pub use session::{Role, SessionError, SessionEvent, SessionOrchestrator, SessionState};
pub use stats::{StatsAggregator, StatsSnapshot};
