use crate::db::poll::{PollId, VoterId};
use crate::error::{PollError, PollResult};
use std::collections::BTreeSet;

/// Lifecycle of one websocket connection.
///
/// `Connecting -> Authenticated -> Idle <-> InRoom -> Disconnected`. A
/// connection that fails the handshake never leaves `Connecting` and is
/// never upgraded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated(VoterId),
    Idle(VoterId),
    InRoom {
        voter: VoterId,
        rooms: BTreeSet<PollId>,
    },
    Disconnected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Connecting
    }
}

impl ConnectionState {
    pub fn authenticate(self, voter: VoterId) -> PollResult<Self> {
        match self {
            ConnectionState::Connecting => Ok(ConnectionState::Authenticated(voter)),
            _ => Err(PollError::Unauthenticated(
                "Connection is already authenticated".to_owned(),
            )),
        }
    }

    /// Socket upgraded and ready for room traffic.
    pub fn open(self) -> Self {
        match self {
            ConnectionState::Authenticated(voter) => ConnectionState::Idle(voter),
            other => other,
        }
    }

    pub fn voter(&self) -> Option<&VoterId> {
        match self {
            ConnectionState::Authenticated(voter)
            | ConnectionState::Idle(voter)
            | ConnectionState::InRoom { voter, .. } => Some(voter),
            ConnectionState::Connecting | ConnectionState::Disconnected => None,
        }
    }

    pub fn is_member(&self, poll: PollId) -> bool {
        match self {
            ConnectionState::InRoom { rooms, .. } => rooms.contains(&poll),
            _ => false,
        }
    }

    /// Returns whether the connection was not yet in the room.
    pub fn join(&mut self, poll: PollId) -> PollResult<bool> {
        match std::mem::take(self) {
            ConnectionState::Idle(voter) => {
                *self = ConnectionState::InRoom {
                    voter,
                    rooms: BTreeSet::from([poll]),
                };
                Ok(true)
            }
            ConnectionState::InRoom { voter, mut rooms } => {
                let joined = rooms.insert(poll);
                *self = ConnectionState::InRoom { voter, rooms };
                Ok(joined)
            }
            other => {
                *self = other;
                Err(PollError::Unauthenticated("Connection is not open".to_owned()))
            }
        }
    }

    /// Returns whether the connection was in the room.
    pub fn leave(&mut self, poll: PollId) -> bool {
        match std::mem::take(self) {
            ConnectionState::InRoom { voter, mut rooms } => {
                let left = rooms.remove(&poll);
                *self = if rooms.is_empty() {
                    ConnectionState::Idle(voter)
                } else {
                    ConnectionState::InRoom { voter, rooms }
                };
                left
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// Moves to `Disconnected`, returning the rooms that were left.
    pub fn disconnect(&mut self) -> Vec<PollId> {
        match std::mem::replace(self, ConnectionState::Disconnected) {
            ConnectionState::InRoom { rooms, .. } => rooms.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Identity a socket vote is cast as. A vote may repeat the voter id but
    /// never name someone else.
    pub fn resolve_voter(&self, claimed: Option<&str>) -> PollResult<VoterId> {
        let voter = match self {
            ConnectionState::Idle(voter) | ConnectionState::InRoom { voter, .. } => voter,
            _ => {
                return Err(PollError::Unauthenticated(
                    "Connection is not open".to_owned(),
                ))
            }
        };
        match claimed {
            Some(claimed) if claimed != voter.as_str() => Err(PollError::IdentityMismatch),
            _ => Ok(voter.clone()),
        }
    }
}
