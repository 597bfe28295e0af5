//! Session lifecycle orchestration
//!
//! Turns host / join / disconnect requests into the ordered sequence of
//! sign-in, relay, transport and network-role calls, and keeps the single
//! observable [`SessionState`] consistent through every outcome.

mod error;
mod events;
mod orchestrator;
mod state;

pub use error::{SessionError, Stage, StageFailure};
pub use events::SessionEvent;
pub use orchestrator::{RoleEventSubscription, SessionOrchestrator};
pub use state::{Role, SessionState};
