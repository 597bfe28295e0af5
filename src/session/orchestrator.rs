//! Session orchestrator
//!
//! Host flow:
//!
//! ```text
//! Idle --request_host--> Hosting
//!   sign-in -> create allocation -> join code fetch
//!   -> transport configuration (authority) -> network role start
//! Hosting --ok--> Authority      Hosting --err--> Idle
//! ```
//!
//! Join flow is the same with join allocation in place of the two allocation
//! steps and the participant side of the transport. Every failure rolls the
//! state back to `Idle` and publishes exactly one `ConnectionError`.

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::error::{SessionError, Stage, StageFailure};
use super::events::SessionEvent;
use super::state::{Role, SessionState};
use crate::config::SessionConfig;
use crate::services::{AuthorityMode, PeerId, RelayError, RoleEvent, Services, TransportRole};

/// Drives host and join attempts and owns the session state
pub struct SessionOrchestrator {
    config: SessionConfig,
    services: Services,
    state: RwLock<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionOrchestrator {
    /// Create an idle orchestrator around the injected collaborators
    pub fn new(config: SessionConfig, services: Services) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let mode = if config.dedicated_server {
            AuthorityMode::Server
        } else {
            AuthorityMode::Host
        };
        let state = SessionState::new(config.max_connections, mode);

        Self {
            config,
            services,
            state: RwLock::new(state),
            events,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Copy of the current state
    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn role(&self) -> Role {
        self.state.read().role
    }

    pub fn join_code(&self) -> Option<String> {
        self.state.read().join_code.clone()
    }

    pub fn connected_peer_count(&self) -> u32 {
        self.state.read().connected_peer_count
    }

    pub fn capacity(&self) -> u32 {
        self.state.read().capacity
    }

    pub fn is_transitioning(&self) -> bool {
        self.state.read().is_transitioning
    }

    pub fn status(&self) -> String {
        self.state.read().status.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    /// Reserve relay capacity, start as the authority and return the join code
    pub async fn request_host(&self, capacity: u32) -> Result<String, SessionError> {
        if capacity == 0 {
            return Err(SessionError::Validation(
                "capacity must be at least 1".to_string(),
            ));
        }

        let mut attempt = self.begin_attempt(Role::Hosting, "Starting host...")?;
        match self.run_host(&mut attempt, capacity).await {
            Ok(join_code) => {
                self.complete_host(capacity, &join_code);
                attempt.finish();
                Ok(join_code)
            }
            Err(err) => Err(attempt.fail(err)),
        }
    }

    /// Join the session behind `join_code` as a participant
    pub async fn request_join(&self, join_code: &str) -> Result<(), SessionError> {
        let join_code = join_code.trim();
        if join_code.is_empty() {
            // A running attempt keeps its own status
            if !self.is_transitioning() {
                self.set_status("Please enter a join code");
            }
            return Err(SessionError::Validation(
                "join code must not be empty".to_string(),
            ));
        }

        let mut attempt = self.begin_attempt(Role::Joining, "Joining game...")?;
        match self.run_join(&mut attempt, join_code).await {
            Ok(()) => {
                self.complete_join();
                attempt.finish();
                Ok(())
            }
            Err(err) => Err(attempt.fail(err)),
        }
    }

    /// Stop the network role and return to `Idle`
    ///
    /// No-op when already idle. Rejected while a host or join attempt is in
    /// flight.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        let previous = {
            let mut state = self.state.write();
            if state.is_transitioning {
                return Err(SessionError::AlreadyInProgress);
            }
            if state.role == Role::Idle {
                return Ok(());
            }
            // Hold off new attempts while the role shuts down
            state.is_transitioning = true;
            state.role
        };

        self.services.role.stop();

        let status = match previous {
            Role::Authority => "Host stopped",
            _ => "Disconnected from game",
        };
        {
            let mut state = self.state.write();
            state.role = Role::Idle;
            state.is_transitioning = false;
            state.join_code = None;
            state.connected_peer_count = 0;
            state.capacity = self.config.max_connections;
            state.status = status.to_string();
        }

        info!("Session closed (was {})", previous);
        self.emit(SessionEvent::ConnectionStateChanged(false));
        self.emit(SessionEvent::StatusChanged(status.to_string()));
        Ok(())
    }

    /// Intake for a peer-connected notification
    pub fn on_peer_connected(&self, peer: PeerId) {
        let local = self.services.role.local_peer_id();
        let status = {
            let mut state = self.state.write();
            if state.role == Role::Idle {
                debug!("Ignoring connect of peer {} while idle", peer);
                return;
            }
            state.connected_peer_count = state.connected_peer_count.saturating_add(1);
            let status = match state.role {
                Role::Authority => Some(format!("Player joined! ({})", state.occupancy())),
                Role::Participant if local == Some(peer) => Some("Connected to game!".to_string()),
                _ => None,
            };
            if let Some(ref status) = status {
                state.status = status.clone();
            }
            status
        };

        debug!("Peer {} connected", peer);
        if let Some(status) = status {
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    /// Intake for a peer-disconnected notification
    pub fn on_peer_disconnected(&self, peer: PeerId) {
        let local = self.services.role.local_peer_id();
        let (status, session_ended) = {
            let mut state = self.state.write();
            if state.role == Role::Idle {
                debug!("Ignoring disconnect of peer {} while idle", peer);
                return;
            }
            state.connected_peer_count = state.connected_peer_count.saturating_sub(1);
            match state.role {
                Role::Authority => {
                    let status = format!("Player left ({})", state.occupancy());
                    state.status = status.clone();
                    (Some(status), false)
                }
                Role::Participant if local == Some(peer) => (None, true),
                _ => (None, false),
            }
        };

        debug!("Peer {} disconnected", peer);
        if let Some(status) = status {
            self.emit(SessionEvent::StatusChanged(status));
        }
        if session_ended {
            info!("Disconnected by the authority");
            if let Err(e) = self.disconnect() {
                warn!("Failed to close ended session: {}", e);
            }
        }
    }

    /// Dispatch one network role event
    pub fn handle_role_event(&self, event: RoleEvent) {
        match event {
            RoleEvent::RoleStarted => debug!("Network role started"),
            RoleEvent::PeerConnected(peer) => self.on_peer_connected(peer),
            RoleEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
        }
    }

    /// Feed network role events into this orchestrator until the returned
    /// subscription is dropped
    pub fn subscribe_role_events(self: &Arc<Self>) -> RoleEventSubscription {
        let events = self.services.role.subscribe();
        let handle = tokio::spawn(role_event_intake(Arc::downgrade(self), events));
        RoleEventSubscription { handle }
    }

    async fn run_host(
        &self,
        attempt: &mut Attempt<'_>,
        capacity: u32,
    ) -> Result<String, SessionError> {
        self.ensure_signed_in(attempt).await?;

        let allocation = attempt
            .remote(
                Stage::CreateAllocation,
                self.services.relay.create_allocation(capacity),
            )
            .await?;
        info!(
            "Allocation {} created in {}",
            allocation.allocation_id, allocation.region
        );

        let join_code = attempt
            .remote(
                Stage::GetJoinCode,
                self.services.relay.get_join_code(allocation.allocation_id),
            )
            .await?;
        if join_code.trim().is_empty() {
            return Err(SessionError::at(
                Stage::GetJoinCode,
                RelayError::Unavailable("relay returned an empty join code".to_string()),
            ));
        }

        attempt.enter(Stage::ConfigureTransport);
        self.services
            .transport
            .configure(&allocation, TransportRole::Authority)
            .map_err(|e| SessionError::at(Stage::ConfigureTransport, e))?;

        attempt.enter(Stage::StartRole);
        let mode = self.state.read().authority_mode;
        if !self.services.role.become_authority(mode) {
            return Err(SessionError::at(Stage::StartRole, StageFailure::RoleStart));
        }

        Ok(join_code)
    }

    async fn run_join(&self, attempt: &mut Attempt<'_>, join_code: &str) -> Result<(), SessionError> {
        self.ensure_signed_in(attempt).await?;

        let allocation = attempt
            .remote(
                Stage::JoinAllocation,
                self.services.relay.join_allocation(join_code),
            )
            .await?;
        info!("Joined allocation {}", allocation.allocation_id);

        attempt.enter(Stage::ConfigureTransport);
        self.services
            .transport
            .configure(&allocation, TransportRole::Participant)
            .map_err(|e| SessionError::at(Stage::ConfigureTransport, e))?;

        attempt.enter(Stage::StartRole);
        if !self.services.role.become_participant() {
            return Err(SessionError::at(Stage::StartRole, StageFailure::RoleStart));
        }

        Ok(())
    }

    async fn ensure_signed_in(&self, attempt: &mut Attempt<'_>) -> Result<(), SessionError> {
        if self.services.auth.is_signed_in() {
            debug!("Already signed in");
            return Ok(());
        }

        let token = attempt
            .remote(Stage::SignIn, self.services.auth.sign_in())
            .await?;
        debug!("Signed in as {}", token.player_id);
        Ok(())
    }

    /// Claim the in-flight slot for a new attempt
    fn begin_attempt(&self, pending: Role, status: &str) -> Result<Attempt<'_>, SessionError> {
        {
            let mut state = self.state.write();
            if state.is_transitioning || state.role != Role::Idle {
                debug!(
                    "Rejecting {} request: role={}, transitioning={}",
                    pending, state.role, state.is_transitioning
                );
                return Err(SessionError::AlreadyInProgress);
            }
            state.role = pending;
            state.is_transitioning = true;
            state.join_code = None;
            state.connected_peer_count = 0;
            state.last_error = None;
            state.status = status.to_string();
        }

        info!("{}", status);
        self.emit(SessionEvent::StatusChanged(status.to_string()));
        Ok(Attempt {
            orchestrator: self,
            pending,
            stage: Stage::SignIn,
            finished: false,
        })
    }

    fn complete_host(&self, capacity: u32, join_code: &str) {
        let status = format!("Host started! Join Code: {}", join_code);
        {
            let mut state = self.state.write();
            state.role = Role::Authority;
            state.is_transitioning = false;
            state.join_code = Some(join_code.to_string());
            state.capacity = capacity;
            state.status = status.clone();
        }

        info!("{}", status);
        self.emit(SessionEvent::JoinCodeGenerated(join_code.to_string()));
        self.emit(SessionEvent::ConnectionStateChanged(true));
        self.emit(SessionEvent::StatusChanged(status));
    }

    fn complete_join(&self) {
        let status = "Connected to game!";
        {
            let mut state = self.state.write();
            state.role = Role::Participant;
            state.is_transitioning = false;
            state.status = status.to_string();
        }

        info!("{}", status);
        self.emit(SessionEvent::ConnectionStateChanged(true));
        self.emit(SessionEvent::StatusChanged(status.to_string()));
    }

    /// Restore `Idle` after a failed attempt
    fn rollback(&self, pending: Role, err: &SessionError) {
        let message = err.to_string();
        let status = match pending {
            Role::Hosting => format!("Host error: {}", message),
            _ => format!("Join error: {}", message),
        };
        {
            let mut state = self.state.write();
            state.role = Role::Idle;
            state.is_transitioning = false;
            state.join_code = None;
            state.connected_peer_count = 0;
            state.capacity = self.config.max_connections;
            state.status = status.clone();
            state.last_error = Some(message.clone());
        }

        error!("{}", status);
        self.emit(SessionEvent::StatusChanged(status));
        self.emit(SessionEvent::ConnectionError(message));
    }

    fn set_status(&self, status: &str) {
        self.state.write().status = status.to_string();
        self.emit(SessionEvent::StatusChanged(status.to_string()));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if self.state.get_mut().role.is_connected() {
            self.services.role.stop();
        }
    }
}

/// One host or join attempt
///
/// Dropping an unfinished attempt (for example when the request future is
/// cancelled) rolls the state back as a failure at the current stage.
struct Attempt<'a> {
    orchestrator: &'a SessionOrchestrator,
    pending: Role,
    stage: Stage,
    finished: bool,
}

impl Attempt<'_> {
    fn enter(&mut self, stage: Stage) {
        debug!("{} attempt: {}", self.pending, stage);
        self.stage = stage;
    }

    /// Run one remote step under the configured timeout
    async fn remote<T, E, F>(&mut self, stage: Stage, call: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StageFailure>,
    {
        self.enter(stage);
        let limit = self.orchestrator.config.step_timeout();
        match timeout(limit, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(SessionError::at(stage, err)),
            Err(_) => Err(SessionError::at(stage, StageFailure::Timeout(limit))),
        }
    }

    fn fail(mut self, err: SessionError) -> SessionError {
        self.finished = true;
        self.orchestrator.rollback(self.pending, &err);
        err
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let err = SessionError::at(self.stage, StageFailure::Cancelled);
            self.orchestrator.rollback(self.pending, &err);
        }
    }
}

/// Live feed of network role events into an orchestrator
///
/// The intake task stops when this is dropped.
pub struct RoleEventSubscription {
    handle: JoinHandle<()>,
}

impl RoleEventSubscription {
    /// Stop the intake task
    pub fn unsubscribe(self) {}
}

impl Drop for RoleEventSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn role_event_intake(
    orchestrator: Weak<SessionOrchestrator>,
    mut events: broadcast::Receiver<RoleEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => match orchestrator.upgrade() {
                Some(orchestrator) => orchestrator.handle_role_event(event),
                None => break,
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!("Dropped {} network role events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Role event intake stopped");
}
