//! Events published by the session orchestrator

/// Lifecycle notifications for presentation layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Hosting succeeded and the relay issued this join code
    JoinCodeGenerated(String),
    /// The session became connected (`true`) or was torn down (`false`)
    ConnectionStateChanged(bool),
    /// A host or join attempt failed; the message names the failing stage
    ConnectionError(String),
    /// The human-readable status line changed
    StatusChanged(String),
}
