use super::{
    poll::{NewPoll, OptionId, OptionTally, Poll, PollId, ReadModel, VoterId},
    vote::{Ballot, VoteOutcome},
    PollStore,
};
use crate::error::{PollError, PollResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

struct StoredPoll {
    poll: Poll,
    options: Vec<(OptionId, String)>,
    // Insertion order breaks ties between polls created in the same instant.
    seq: u64,
}

#[derive(Default)]
struct Tables {
    polls: HashMap<PollId, StoredPoll>,
    votes: HashMap<(PollId, VoterId), OptionId>,
    next_seq: u64,
}

impl Tables {
    fn expire(&mut self, id: PollId, now: DateTime<Utc>) -> bool {
        match self.polls.get_mut(&id) {
            Some(stored) if stored.poll.is_active && stored.poll.is_expired(now) => {
                stored.poll.is_active = false;
                stored.poll.revision += 1;
                true
            }
            _ => false,
        }
    }

    fn project(&self, id: PollId) -> Option<ReadModel> {
        let stored = self.polls.get(&id)?;
        let options = stored
            .options
            .iter()
            .map(|(option_id, text)| OptionTally {
                id: *option_id,
                text: text.clone(),
                votes: self
                    .votes
                    .iter()
                    .filter(|((poll_id, _), chosen)| *poll_id == id && *chosen == option_id)
                    .count() as i64,
            })
            .collect();
        Some(ReadModel::new(stored.poll.clone(), options))
    }
}

/// Single-process store with the same transactional contract as [`super::PgStore`].
///
/// Every operation runs under one lock, which stands in for the row locks
/// and transaction isolation Postgres provides.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vote_rows(&self, poll_id: PollId) -> usize {
        self.tables
            .lock()
            .votes
            .keys()
            .filter(|(id, _)| *id == poll_id)
            .count()
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn create_poll(&self, poll: NewPoll, now: DateTime<Utc>) -> PollResult<PollId> {
        let id = PollId::new();
        let mut tables = self.tables.lock();
        let seq = tables.next_seq;
        tables.next_seq += 1;
        tables.polls.insert(
            id,
            StoredPoll {
                poll: Poll {
                    id,
                    title: poll.title,
                    description: poll.description,
                    created_by: poll.created_by,
                    created_at: now,
                    expires_at: poll.expires_at,
                    is_active: true,
                    revision: 0,
                },
                options: poll
                    .options
                    .into_iter()
                    .map(|text| (OptionId::new(), text))
                    .collect(),
                seq,
            },
        );
        debug!(poll_id = %id, "Poll stored in memory");
        Ok(id)
    }

    async fn load_read_model(
        &self,
        id: PollId,
        now: DateTime<Utc>,
    ) -> PollResult<Option<ReadModel>> {
        let mut tables = self.tables.lock();
        if tables.expire(id, now) {
            debug!(poll_id = %id, "Closed expired poll on read");
        }
        Ok(tables.project(id))
    }

    async fn list_poll_ids(&self, limit: i64, offset: i64) -> PollResult<Vec<PollId>> {
        let tables = self.tables.lock();
        let mut polls: Vec<&StoredPoll> = tables.polls.values().collect();
        polls.sort_by(|a, b| {
            b.poll
                .created_at
                .cmp(&a.poll.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(polls
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|stored| stored.poll.id)
            .collect())
    }

    async fn record_vote(&self, ballot: &Ballot, now: DateTime<Utc>) -> PollResult<VoteOutcome> {
        let mut tables = self.tables.lock();
        let stored = tables
            .polls
            .get(&ballot.poll_id)
            .ok_or(PollError::NotFound)?;
        if !stored.poll.is_active {
            return Err(PollError::PollClosed);
        }
        if tables.expire(ballot.poll_id, now) {
            return Ok(VoteOutcome::Expired);
        }
        let stored = &tables.polls[&ballot.poll_id];
        if !stored.options.iter().any(|(id, _)| *id == ballot.option_id) {
            return Err(PollError::InvalidOption);
        }

        let key = (ballot.poll_id, ballot.voter_id.clone());
        let previous = match tables.votes.get(&key) {
            Some(current) if *current == ballot.option_id => return Ok(VoteOutcome::Unchanged),
            other => other.copied(),
        };
        tables.votes.insert(key, ballot.option_id);

        let stored = tables
            .polls
            .get_mut(&ballot.poll_id)
            .ok_or(PollError::NotFound)?;
        stored.poll.revision += 1;
        let revision = stored.poll.revision;

        Ok(match previous {
            Some(previous) => VoteOutcome::Changed { previous, revision },
            None => VoteOutcome::Recorded { revision },
        })
    }

    async fn close_expired(&self, now: DateTime<Utc>) -> PollResult<Vec<PollId>> {
        let mut tables = self.tables.lock();
        let expired: Vec<PollId> = tables
            .polls
            .values()
            .filter(|stored| stored.poll.is_active && stored.poll.is_expired(now))
            .map(|stored| stored.poll.id)
            .collect();
        for id in &expired {
            tables.expire(*id, now);
        }
        Ok(expired)
    }

    async fn ping(&self) -> PollResult<()> {
        Ok(())
    }
}
