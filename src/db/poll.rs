use crate::error::{PollError, PollResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Uuid;
use std::fmt;
use std::str::FromStr;

pub const MIN_OPTIONS: usize = 2;

#[derive(
    Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Deserialize, Serialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct PollId(pub Uuid);

impl PollId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PollId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PollId {
    type Err = PollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|_| PollError::NotFound)
    }
}

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct OptionId(pub Uuid);

impl OptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque subject of a verified bearer token.
#[derive(Clone, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct VoterId(pub String);

impl VoterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: PollId,
    pub title: String,
    pub description: Option<String>,
    pub created_by: VoterId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub revision: i64,
}

impl Poll {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at <= now)
    }

    pub fn accepts_votes(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OptionTally {
    pub id: OptionId,
    pub text: String,
    pub votes: i64,
}

/// Poll snapshot with live counts, the value cached and pushed to viewers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadModel {
    #[serde(flatten)]
    pub poll: Poll,
    pub options: Vec<OptionTally>,
    pub total_votes: i64,
}

impl ReadModel {
    pub fn new(poll: Poll, options: Vec<OptionTally>) -> Self {
        let total_votes = options.iter().map(|option| option.votes).sum();
        Self {
            poll,
            options,
            total_votes,
        }
    }

    pub fn id(&self) -> PollId {
        self.poll.id
    }

    pub fn revision(&self) -> i64 {
        self.poll.revision
    }

    pub fn votes_for(&self, option: OptionId) -> Option<i64> {
        self.options
            .iter()
            .find(|tally| tally.id == option)
            .map(|tally| tally.votes)
    }
}

#[derive(Clone, Debug)]
pub struct NewPoll {
    pub title: String,
    pub description: Option<String>,
    pub options: Vec<String>,
    pub created_by: VoterId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewPoll {
    /// Trims text fields and rejects polls that could never be voted on.
    pub fn validate(mut self, now: DateTime<Utc>) -> PollResult<Self> {
        self.title = self.title.trim().to_owned();
        if self.title.is_empty() {
            return Err(PollError::invalid("Title is required"));
        }
        self.description = self
            .description
            .map(|d| d.trim().to_owned())
            .filter(|d| !d.is_empty());
        self.options = self.options.iter().map(|o| o.trim().to_owned()).collect();
        if self.options.len() < MIN_OPTIONS {
            return Err(PollError::invalid("At least two options are required"));
        }
        if self.options.iter().any(|o| o.is_empty()) {
            return Err(PollError::invalid("Options must not be blank"));
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return Err(PollError::invalid("Expiry must be in the future"));
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft(options: &[&str]) -> NewPoll {
        NewPoll {
            title: " Lunch? ".to_owned(),
            description: Some("  ".to_owned()),
            options: options.iter().map(|o| o.to_string()).collect(),
            created_by: VoterId("creator".to_owned()),
            expires_at: None,
        }
    }

    #[test]
    fn validate_trims_and_drops_blank_description() {
        let poll = draft(&["A", " B "]).validate(Utc::now()).unwrap();
        assert_eq!(poll.title, "Lunch?");
        assert_eq!(poll.description, None);
        assert_eq!(poll.options, vec!["A", "B"]);
    }

    #[test]
    fn validate_rejects_single_option_and_past_expiry() {
        let now = Utc::now();
        assert!(matches!(
            draft(&["A"]).validate(now),
            Err(PollError::InvalidInput(_))
        ));

        let mut expired = draft(&["A", "B"]);
        expired.expires_at = Some(now - Duration::seconds(1));
        assert!(matches!(
            expired.validate(now),
            Err(PollError::InvalidInput(_))
        ));
    }

    #[test]
    fn read_model_total_is_sum_of_options() {
        let poll = Poll {
            id: PollId::new(),
            title: "t".to_owned(),
            description: None,
            created_by: VoterId("c".to_owned()),
            created_at: Utc::now(),
            expires_at: None,
            is_active: true,
            revision: 3,
        };
        let a = OptionId::new();
        let model = ReadModel::new(
            poll,
            vec![
                OptionTally {
                    id: a,
                    text: "A".to_owned(),
                    votes: 2,
                },
                OptionTally {
                    id: OptionId::new(),
                    text: "B".to_owned(),
                    votes: 1,
                },
            ],
        );
        assert_eq!(model.total_votes, 3);
        assert_eq!(model.votes_for(a), Some(2));
    }
}
