//! Observable session state

use std::fmt;

use crate::services::AuthorityMode;

/// Role of the local process in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Not in a session
    #[default]
    Idle,
    /// Host attempt in flight
    Hosting,
    /// Join attempt in flight
    Joining,
    /// Connected as the session authority
    Authority,
    /// Connected as a participant
    Participant,
}

impl Role {
    /// Check if a session is established
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Authority | Self::Participant)
    }

    /// Check if a host or join attempt is under way
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Hosting | Self::Joining)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Hosting => "hosting",
            Self::Joining => "joining",
            Self::Authority => "authority",
            Self::Participant => "participant",
        };
        f.write_str(name)
    }
}

/// Snapshot of the orchestrator's state
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub role: Role,
    /// True while a host or join attempt is in flight
    pub is_transitioning: bool,
    /// Present only while connected as the authority
    pub join_code: Option<String>,
    pub connected_peer_count: u32,
    /// Remote participant slots
    pub capacity: u32,
    pub authority_mode: AuthorityMode,
    pub status: String,
    /// Message of the most recent failed attempt
    pub last_error: Option<String>,
}

impl SessionState {
    pub(crate) fn new(capacity: u32, authority_mode: AuthorityMode) -> Self {
        Self {
            role: Role::Idle,
            is_transitioning: false,
            join_code: None,
            connected_peer_count: 0,
            capacity,
            authority_mode,
            status: "Ready to connect".to_string(),
            last_error: None,
        }
    }

    /// Players the session holds, host included
    pub fn max_players(&self) -> u32 {
        self.capacity.saturating_add(1)
    }

    /// Occupancy label such as "2/8 players"
    pub fn occupancy(&self) -> String {
        format!("{}/{} players", self.connected_peer_count, self.max_players())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = SessionState::new(7, AuthorityMode::Host);
        assert_eq!(state.role, Role::Idle);
        assert!(!state.is_transitioning);
        assert!(state.join_code.is_none());
        assert_eq!(state.occupancy(), "0/8 players");
    }

    #[test]
    fn test_role_predicates() {
        assert!(Role::Authority.is_connected());
        assert!(Role::Participant.is_connected());
        assert!(!Role::Hosting.is_connected());
        assert!(Role::Joining.is_pending());
        assert!(!Role::Idle.is_pending());
    }
}
