//! Session error types

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::services::{AuthError, RelayError, TransportError};

/// Step of a host or join attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SignIn,
    CreateAllocation,
    GetJoinCode,
    JoinAllocation,
    ConfigureTransport,
    StartRole,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SignIn => "sign-in",
            Self::CreateAllocation => "create allocation",
            Self::GetJoinCode => "join code fetch",
            Self::JoinAllocation => "join allocation",
            Self::ConfigureTransport => "transport configuration",
            Self::StartRole => "network role start",
        };
        f.write_str(name)
    }
}

/// Why a stage failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageFailure {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Network role did not start")]
    RoleStart,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Attempt cancelled")]
    Cancelled,
}

/// Errors returned by the session orchestrator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("A host or join attempt is already in progress")]
    AlreadyInProgress,

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageFailure,
    },
}

impl SessionError {
    pub(crate) fn at(stage: Stage, failure: impl Into<StageFailure>) -> Self {
        Self::Stage {
            stage,
            source: failure.into(),
        }
    }

    /// The stage that failed, for errors raised by a remote step
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
