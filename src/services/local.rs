//! In-process collaborator implementations
//!
//! Used by the demo and console commands and by the test suite. The relay keeps
//! allocations in memory, so several orchestrators sharing one [`LocalRelay`]
//! can host and join each other without any network service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AllocationData, AuthError, AuthorityMode, NetworkRole, PeerId, RelayClient, RelayEndpoint,
    RelayError, RelayProtocol, RemoteAuth, RoleEvent, SessionToken, TransportBinding,
    TransportError, TransportRole,
};
use crate::stats::{MetricsProbe, TransportMetrics};

/// Characters used in join codes (no 0/O or 1/I look-alikes)
pub const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated join codes
pub const JOIN_CODE_LENGTH: usize = 6;

/// Largest allocation the local relay accepts
pub const MAX_RELAY_CONNECTIONS: u32 = 100;

/// How long an allocation stays joinable
const DEFAULT_ALLOCATION_TTL: Duration = Duration::from_secs(60 * 60);

/// Peer id the networking engine assigns to the authority
const AUTHORITY_PEER_ID: PeerId = PeerId(0);

/// Generate a random join code
pub fn generate_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LENGTH)
        .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Anonymous sign-in
#[derive(Default)]
pub struct LocalAuth {
    token: Mutex<Option<SessionToken>>,
    failure: Mutex<Option<AuthError>>,
    latency: Duration,
    calls: AtomicUsize,
}

impl LocalAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every sign-in by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make sign-in fail with `error` until cleared with `None`
    pub fn set_failure(&self, error: Option<AuthError>) {
        *self.failure.lock() = error;
    }

    /// Number of sign-in calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteAuth for LocalAuth {
    fn is_signed_in(&self) -> bool {
        self.token.lock().is_some()
    }

    async fn sign_in(&self) -> Result<SessionToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }

        let mut token = self.token.lock();
        if let Some(existing) = token.as_ref() {
            return Ok(existing.clone());
        }

        let issued = SessionToken {
            player_id: Uuid::new_v4().simple().to_string(),
            token: Uuid::new_v4().simple().to_string(),
        };
        info!("Signed in anonymously as {}", issued.player_id);
        *token = Some(issued.clone());
        Ok(issued)
    }
}

/// Operations offered by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayOperation {
    CreateAllocation,
    GetJoinCode,
    JoinAllocation,
}

struct StoredAllocation {
    data: AllocationData,
    max_connections: u32,
    joined: u32,
    join_code: Option<String>,
    expires_at: Instant,
}

#[derive(Default)]
struct RelayStore {
    allocations: HashMap<Uuid, StoredAllocation>,
    codes: HashMap<String, Uuid>,
}

impl RelayStore {
    /// Drop allocations past their TTL along with their join codes
    fn purge_expired(&mut self, now: Instant) {
        let before = self.allocations.len();
        self.allocations.retain(|_, a| a.expires_at > now);
        let allocations = &self.allocations;
        self.codes.retain(|_, id| allocations.contains_key(id));

        let purged = before - self.allocations.len();
        if purged > 0 {
            debug!("Purged {} expired allocations", purged);
        }
    }

    fn unused_code(&self) -> String {
        loop {
            let code = generate_join_code();
            if !self.codes.contains_key(&code) {
                return code;
            }
        }
    }
}

/// In-memory relay allocation service
///
/// Clones share the same allocations, failure table and counters.
#[derive(Clone)]
pub struct LocalRelay {
    store: Arc<Mutex<RelayStore>>,
    failures: Arc<Mutex<HashMap<RelayOperation, RelayError>>>,
    calls: Arc<Mutex<HashMap<RelayOperation, usize>>>,
    latency: Duration,
    ttl: Duration,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(RelayStore::default())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
            latency: Duration::ZERO,
            ttl: DEFAULT_ALLOCATION_TTL,
        }
    }

    /// Delay every operation by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Expire allocations `ttl` after creation
    pub fn with_allocation_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Make `operation` fail with `error` until cleared
    pub fn fail(&self, operation: RelayOperation, error: RelayError) {
        self.failures.lock().insert(operation, error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Number of calls received for `operation`
    pub fn calls(&self, operation: RelayOperation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Number of calls received across all operations
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Release the allocation behind `join_code` before its TTL
    ///
    /// Models the relay freeing an allocation once its host has left.
    /// Returns `false` for unknown codes.
    pub fn release_join_code(&self, join_code: &str) -> bool {
        let code = join_code.trim().to_ascii_uppercase();
        let mut store = self.store.lock();
        let Some(allocation_id) = store.codes.remove(&code) else {
            return false;
        };
        store.allocations.remove(&allocation_id);
        debug!("Released allocation {} ({})", allocation_id, code);
        true
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.store.lock().allocations.len()
    }

    async fn enter(&self, operation: RelayOperation) -> Result<(), RelayError> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.failures.lock().get(&operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn new_allocation_data(endpoint_host: &str) -> AllocationData {
        let mut rng = rand::thread_rng();
        let mut key = vec![0u8; 64];
        rng.fill(key.as_mut_slice());
        let mut connection_data = vec![0u8; 16];
        rng.fill(connection_data.as_mut_slice());

        AllocationData {
            allocation_id: Uuid::new_v4(),
            region: "local".to_string(),
            endpoints: vec![
                RelayEndpoint {
                    protocol: RelayProtocol::Udp,
                    host: endpoint_host.to_string(),
                    port: 7777,
                },
                RelayEndpoint {
                    protocol: RelayProtocol::Dtls,
                    host: endpoint_host.to_string(),
                    port: 7778,
                },
                RelayEndpoint {
                    protocol: RelayProtocol::Wss,
                    host: endpoint_host.to_string(),
                    port: 443,
                },
            ],
            key,
            connection_data,
            host_connection_data: None,
        }
    }
}

#[async_trait]
impl RelayClient for LocalRelay {
    async fn create_allocation(&self, max_connections: u32) -> Result<AllocationData, RelayError> {
        self.enter(RelayOperation::CreateAllocation).await?;

        if max_connections == 0 || max_connections > MAX_RELAY_CONNECTIONS {
            return Err(RelayError::InvalidCapacity(max_connections));
        }

        let data = Self::new_allocation_data("127.0.0.1");
        let now = Instant::now();
        let mut store = self.store.lock();
        store.purge_expired(now);
        store.allocations.insert(
            data.allocation_id,
            StoredAllocation {
                data: data.clone(),
                max_connections,
                joined: 0,
                join_code: None,
                expires_at: now + self.ttl,
            },
        );

        debug!(
            "Created allocation {} for {} connections",
            data.allocation_id, max_connections
        );
        Ok(data)
    }

    async fn get_join_code(&self, allocation_id: Uuid) -> Result<String, RelayError> {
        self.enter(RelayOperation::GetJoinCode).await?;

        let mut store = self.store.lock();
        store.purge_expired(Instant::now());
        let existing = store
            .allocations
            .get(&allocation_id)
            .ok_or_else(|| RelayError::AllocationNotFound(allocation_id.to_string()))?
            .join_code
            .clone();
        if let Some(code) = existing {
            return Ok(code);
        }

        let code = store.unused_code();
        store.codes.insert(code.clone(), allocation_id);
        if let Some(allocation) = store.allocations.get_mut(&allocation_id) {
            allocation.join_code = Some(code.clone());
        }

        debug!("Issued join code {} for allocation {}", code, allocation_id);
        Ok(code)
    }

    async fn join_allocation(&self, join_code: &str) -> Result<AllocationData, RelayError> {
        self.enter(RelayOperation::JoinAllocation).await?;

        let code = join_code.trim().to_ascii_uppercase();
        let mut store = self.store.lock();
        let allocation_id = *store
            .codes
            .get(&code)
            .ok_or_else(|| RelayError::JoinCodeNotFound(code.clone()))?;

        let expired = store
            .allocations
            .get(&allocation_id)
            .map(|a| a.expires_at <= Instant::now())
            .unwrap_or(true);
        if expired {
            store.codes.remove(&code);
            store.allocations.remove(&allocation_id);
            warn!("Join code {} expired", code);
            return Err(RelayError::JoinCodeExpired(code));
        }
        store.purge_expired(Instant::now());

        let allocation = store
            .allocations
            .get_mut(&allocation_id)
            .ok_or_else(|| RelayError::AllocationNotFound(allocation_id.to_string()))?;
        if allocation.joined >= allocation.max_connections {
            return Err(RelayError::AllocationFull(allocation.max_connections));
        }
        allocation.joined += 1;

        let host_connection_data = allocation.data.connection_data.clone();
        let host = allocation
            .data
            .endpoints
            .first()
            .map(|e| e.host.clone())
            .unwrap_or_default();

        let mut data = Self::new_allocation_data(&host);
        data.host_connection_data = Some(host_connection_data);

        debug!("Joined allocation {} with code {}", allocation_id, code);
        Ok(data)
    }
}

/// Transport binding that validates and records relay parameters
pub struct LocalTransport {
    protocol: RelayProtocol,
    configured: Mutex<Option<(TransportRole, RelayEndpoint)>>,
    calls: AtomicUsize,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(RelayProtocol::default())
    }
}

impl LocalTransport {
    pub fn new(protocol: RelayProtocol) -> Self {
        Self {
            protocol,
            configured: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Role and endpoint of the last successful configuration
    pub fn configured(&self) -> Option<(TransportRole, RelayEndpoint)> {
        self.configured.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransportBinding for LocalTransport {
    fn configure(&self, data: &AllocationData, role: TransportRole) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        data.validate(role)?;

        let endpoint = data
            .endpoint(self.protocol)
            .ok_or(TransportError::MissingEndpoint(self.protocol))?
            .clone();

        debug!(
            "Transport configured as {} via {}://{}:{}",
            role, endpoint.protocol, endpoint.host, endpoint.port
        );
        *self.configured.lock() = Some((role, endpoint));
        Ok(())
    }
}

/// Network role that only tracks state and relays events
pub struct LocalNetworkRole {
    events: broadcast::Sender<RoleEvent>,
    running: AtomicBool,
    local_id: Mutex<Option<PeerId>>,
    next_participant_id: AtomicU64,
    fail_start: AtomicBool,
    stop_calls: AtomicUsize,
}

impl Default for LocalNetworkRole {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetworkRole {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            running: AtomicBool::new(false),
            local_id: Mutex::new(None),
            next_participant_id: AtomicU64::new(1),
            fail_start: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
        }
    }

    /// Make the next role starts report failure
    pub fn set_start_failure(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Raise a peer-connected event as the engine would
    pub fn emit_peer_connected(&self, peer: PeerId) {
        let _ = self.events.send(RoleEvent::PeerConnected(peer));
    }

    /// Raise a peer-disconnected event as the engine would
    pub fn emit_peer_disconnected(&self, peer: PeerId) {
        let _ = self.events.send(RoleEvent::PeerDisconnected(peer));
    }

    fn start(&self, local_id: PeerId) -> bool {
        if self.fail_start.load(Ordering::SeqCst) {
            warn!("Network role failed to start");
            return false;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Network role already running");
            return false;
        }
        *self.local_id.lock() = Some(local_id);
        let _ = self.events.send(RoleEvent::RoleStarted);
        true
    }
}

impl NetworkRole for LocalNetworkRole {
    fn become_authority(&self, mode: AuthorityMode) -> bool {
        debug!("Starting authority ({:?})", mode);
        self.start(AUTHORITY_PEER_ID)
    }

    fn become_participant(&self) -> bool {
        let id = PeerId(self.next_participant_id.fetch_add(1, Ordering::SeqCst));
        if !self.start(id) {
            return false;
        }
        self.emit_peer_connected(id);
        true
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("Network role stopped");
        }
        *self.local_id.lock() = None;
    }

    fn local_peer_id(&self) -> Option<PeerId> {
        *self.local_id.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<RoleEvent> {
        self.events.subscribe()
    }
}

/// Metrics probe with values set by the caller
#[derive(Default)]
pub struct LocalMetrics {
    metrics: Mutex<TransportMetrics>,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, metrics: TransportMetrics) {
        *self.metrics.lock() = metrics;
    }
}

impl MetricsProbe for LocalMetrics {
    fn sample(&self) -> TransportMetrics {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_join_code() {
        let code = generate_join_code();
        assert_eq!(code.len(), JOIN_CODE_LENGTH);
        assert!(code.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn test_relay_host_and_join() {
        let relay = LocalRelay::new();
        let allocation = relay.create_allocation(2).await.unwrap();
        let code = relay.get_join_code(allocation.allocation_id).await.unwrap();

        // Same allocation keeps its code
        let again = relay.get_join_code(allocation.allocation_id).await.unwrap();
        assert_eq!(code, again);

        let joined = relay
            .join_allocation(&code.to_ascii_lowercase())
            .await
            .unwrap();
        assert_eq!(
            joined.host_connection_data.as_deref(),
            Some(allocation.connection_data.as_slice())
        );
    }

    #[tokio::test]
    async fn test_relay_rejects_full_allocation() {
        let relay = LocalRelay::new();
        let allocation = relay.create_allocation(1).await.unwrap();
        let code = relay.get_join_code(allocation.allocation_id).await.unwrap();

        assert!(relay.join_allocation(&code).await.is_ok());
        assert_eq!(
            relay.join_allocation(&code).await,
            Err(RelayError::AllocationFull(1))
        );
    }

    #[tokio::test]
    async fn test_relay_unknown_code() {
        let relay = LocalRelay::new();
        assert!(matches!(
            relay.join_allocation("ZZZZZZ").await,
            Err(RelayError::JoinCodeNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_code_expires() {
        let relay = LocalRelay::new().with_allocation_ttl(Duration::from_secs(30));
        let allocation = relay.create_allocation(4).await.unwrap();
        let code = relay.get_join_code(allocation.allocation_id).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(
            relay.join_allocation(&code).await,
            Err(RelayError::JoinCodeExpired(_))
        ));
        assert_eq!(relay.allocation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_purges_expired_allocations() {
        let relay = LocalRelay::new().with_allocation_ttl(Duration::from_secs(30));
        for _ in 0..3 {
            let allocation = relay.create_allocation(4).await.unwrap();
            relay.get_join_code(allocation.allocation_id).await.unwrap();
        }
        assert_eq!(relay.allocation_count(), 3);

        tokio::time::advance(Duration::from_secs(31)).await;

        let fresh = relay.create_allocation(4).await.unwrap();
        assert_eq!(relay.allocation_count(), 1);
        assert_eq!(relay.store.lock().codes.len(), 0);

        relay.get_join_code(fresh.allocation_id).await.unwrap();
        assert_eq!(relay.store.lock().codes.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_release_join_code() {
        let relay = LocalRelay::new();
        let allocation = relay.create_allocation(4).await.unwrap();
        let code = relay.get_join_code(allocation.allocation_id).await.unwrap();

        assert!(relay.release_join_code(&format!(" {} ", code.to_ascii_lowercase())));
        assert_eq!(relay.allocation_count(), 0);
        assert!(matches!(
            relay.join_allocation(&code).await,
            Err(RelayError::JoinCodeNotFound(_))
        ));

        assert!(!relay.release_join_code(&code));
    }

    #[tokio::test]
    async fn test_relay_failure_injection_counts_calls() {
        let relay = LocalRelay::new();
        relay.fail(
            RelayOperation::CreateAllocation,
            RelayError::Unavailable("maintenance".to_string()),
        );

        assert!(relay.create_allocation(4).await.is_err());
        assert_eq!(relay.calls(RelayOperation::CreateAllocation), 1);

        relay.clear_failures();
        assert!(relay.create_allocation(4).await.is_ok());
        assert_eq!(relay.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_is_idempotent() {
        let auth = LocalAuth::new();
        assert!(!auth.is_signed_in());

        let first = auth.sign_in().await.unwrap();
        let second = auth.sign_in().await.unwrap();
        assert_eq!(first, second);
        assert!(auth.is_signed_in());
    }

    #[tokio::test]
    async fn test_transport_selects_protocol_endpoint() {
        let relay = LocalRelay::new();
        let data = relay.create_allocation(4).await.unwrap();

        let transport = LocalTransport::new(RelayProtocol::Wss);
        transport.configure(&data, TransportRole::Authority).unwrap();
        let (role, endpoint) = transport.configured().unwrap();
        assert_eq!(role, TransportRole::Authority);
        assert_eq!(endpoint.port, 443);
    }

    #[test]
    fn test_network_role_lifecycle() {
        let role = LocalNetworkRole::new();
        let mut events = role.subscribe();

        assert!(role.become_authority(AuthorityMode::Host));
        assert_eq!(role.local_peer_id(), Some(AUTHORITY_PEER_ID));
        assert_eq!(events.try_recv().unwrap(), RoleEvent::RoleStarted);

        // Already running
        assert!(!role.become_participant());

        role.stop();
        assert!(!role.is_running());
        assert_eq!(role.local_peer_id(), None);
    }

    #[test]
    fn test_network_role_start_failure() {
        let role = LocalNetworkRole::new();
        role.set_start_failure(true);
        assert!(!role.become_participant());
        assert!(!role.is_running());
    }
}
