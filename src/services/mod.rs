//! External collaborators of the session orchestrator
//!
//! The identity service, relay allocation service, transport binding and
//! network role are reached only through the traits defined here. Concrete
//! implementations are injected through [`Services`] when the orchestrator is
//! built.

mod error;
pub mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use error::{AuthError, RelayError, TransportError};

/// Identifier of a peer inside a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token returned by a successful sign-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub player_id: String,
    pub token: String,
}

/// Connection type offered by a relay endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProtocol {
    Udp,
    #[default]
    Dtls,
    Wss,
}

impl fmt::Display for RelayProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Dtls => write!(f, "dtls"),
            Self::Wss => write!(f, "wss"),
        }
    }
}

/// A relay server address reachable over one protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub protocol: RelayProtocol,
    pub host: String,
    pub port: u16,
}

/// Connection parameters returned by the relay service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationData {
    pub allocation_id: Uuid,
    pub region: String,
    pub endpoints: Vec<RelayEndpoint>,
    /// HMAC key used to sign relay traffic
    pub key: Vec<u8>,
    /// Opaque connection blob identifying this allocation
    pub connection_data: Vec<u8>,
    /// Connection blob of the host (set only for joined allocations)
    pub host_connection_data: Option<Vec<u8>>,
}

impl AllocationData {
    /// Find the endpoint for the given protocol
    pub fn endpoint(&self, protocol: RelayProtocol) -> Option<&RelayEndpoint> {
        self.endpoints.iter().find(|e| e.protocol == protocol)
    }

    /// Check that the parameters are usable for the given role
    pub fn validate(&self, role: TransportRole) -> Result<(), TransportError> {
        if self.allocation_id.is_nil() {
            return Err(TransportError::Malformed("nil allocation id".to_string()));
        }
        if self.key.is_empty() {
            return Err(TransportError::Malformed("empty key".to_string()));
        }
        if self.connection_data.is_empty() {
            return Err(TransportError::Malformed(
                "empty connection data".to_string(),
            ));
        }
        if role == TransportRole::Participant && self.host_connection_data.is_none() {
            return Err(TransportError::Malformed(
                "missing host connection data".to_string(),
            ));
        }
        Ok(())
    }
}

/// Side of the relay the transport is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Authority,
    Participant,
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authority => write!(f, "authority"),
            Self::Participant => write!(f, "participant"),
        }
    }
}

/// How the authority takes part in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorityMode {
    /// Authority that is also a playing peer
    #[default]
    Host,
    /// Dedicated authority with no local player
    Server,
}

/// Events raised by the network role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleEvent {
    RoleStarted,
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// Identity service
#[async_trait]
pub trait RemoteAuth: Send + Sync {
    /// Whether a sign-in has already succeeded
    fn is_signed_in(&self) -> bool;

    /// Sign in, returning the current token if already signed in
    async fn sign_in(&self) -> Result<SessionToken, AuthError>;
}

/// Relay allocation service
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn create_allocation(&self, max_connections: u32) -> Result<AllocationData, RelayError>;

    async fn get_join_code(&self, allocation_id: Uuid) -> Result<String, RelayError>;

    async fn join_allocation(&self, join_code: &str) -> Result<AllocationData, RelayError>;
}

/// Byte transport configuration
pub trait TransportBinding: Send + Sync {
    fn configure(&self, data: &AllocationData, role: TransportRole)
        -> Result<(), TransportError>;
}

/// Network role primitive supplied by the networking engine
pub trait NetworkRole: Send + Sync {
    fn become_authority(&self, mode: AuthorityMode) -> bool;

    fn become_participant(&self) -> bool;

    fn stop(&self);

    /// Id of the local peer once a role has started
    fn local_peer_id(&self) -> Option<PeerId>;

    fn subscribe(&self) -> broadcast::Receiver<RoleEvent>;
}

/// Collaborators injected into the orchestrator
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn RemoteAuth>,
    pub relay: Arc<dyn RelayClient>,
    pub transport: Arc<dyn TransportBinding>,
    pub role: Arc<dyn NetworkRole>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation() -> AllocationData {
        AllocationData {
            allocation_id: Uuid::new_v4(),
            region: "local".to_string(),
            endpoints: vec![RelayEndpoint {
                protocol: RelayProtocol::Dtls,
                host: "127.0.0.1".to_string(),
                port: 7777,
            }],
            key: vec![1; 64],
            connection_data: vec![2; 16],
            host_connection_data: None,
        }
    }

    #[test]
    fn test_endpoint_lookup() {
        let data = allocation();
        assert!(data.endpoint(RelayProtocol::Dtls).is_some());
        assert!(data.endpoint(RelayProtocol::Wss).is_none());
    }

    #[test]
    fn test_participant_requires_host_connection_data() {
        let mut data = allocation();
        assert!(data.validate(TransportRole::Authority).is_ok());
        assert!(matches!(
            data.validate(TransportRole::Participant),
            Err(TransportError::Malformed(_))
        ));

        data.host_connection_data = Some(vec![3; 16]);
        assert!(data.validate(TransportRole::Participant).is_ok());
    }

    #[test]
    fn test_empty_key_is_malformed() {
        let mut data = allocation();
        data.key.clear();
        assert!(data.validate(TransportRole::Authority).is_err());
    }
}
