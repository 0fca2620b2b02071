use super::poll::{OptionId, PollId, VoterId};
use serde::{Deserialize, Serialize};
use sqlx::types::Uuid;

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct VoteId(pub Uuid);

impl VoteId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VoteId {
    fn default() -> Self {
        Self::new()
    }
}

/// One voter's choice for one poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ballot {
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub voter_id: VoterId,
}

/// What a committed vote transaction did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote of this voter on the poll.
    Recorded { revision: i64 },
    /// Existing row now points at another option.
    Changed { previous: OptionId, revision: i64 },
    /// Voter already chose this option, nothing written.
    Unchanged,
    /// The poll was past its expiry and has just been closed instead.
    Expired,
}

impl VoteOutcome {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            VoteOutcome::Recorded { .. } | VoteOutcome::Changed { .. } | VoteOutcome::Expired
        )
    }
}
