//! Collaborator error types

use thiserror::Error;

use super::RelayProtocol;

/// Errors raised by the identity service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Sign-in rejected: {0}")]
    Rejected(String),

    #[error("Authentication service unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the relay allocation service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Join code not found: {0}")]
    JoinCodeNotFound(String),

    #[error("Join code expired: {0}")]
    JoinCodeExpired(String),

    #[error("Allocation not found: {0}")]
    AllocationNotFound(String),

    #[error("Allocation full ({0} connections)")]
    AllocationFull(u32),

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(u32),

    #[error("Relay service unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while binding relay parameters to the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No {0} endpoint in allocation")]
    MissingEndpoint(RelayProtocol),

    #[error("Malformed connection parameters: {0}")]
    Malformed(String),
}
