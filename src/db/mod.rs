pub mod memory;
pub mod poll;
pub mod postgres;
pub mod vote;

use crate::error::PollResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poll::{NewPoll, PollId, ReadModel};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use std::time::Duration;
use vote::{Ballot, VoteOutcome};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Durable source of truth for polls, options and votes.
///
/// Every method is a single atomic unit against the backing store; callers
/// never see a half-created poll or a half-applied vote.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Inserts the poll and all of its options together.
    async fn create_poll(&self, poll: NewPoll, now: DateTime<Utc>) -> PollResult<PollId>;

    /// Consistent snapshot of a poll and its tallies. A poll found past its
    /// expiry while still active is closed first.
    async fn load_read_model(&self, id: PollId, now: DateTime<Utc>)
        -> PollResult<Option<ReadModel>>;

    /// Poll ids ordered newest created first.
    async fn list_poll_ids(&self, limit: i64, offset: i64) -> PollResult<Vec<PollId>>;

    /// Checks the ballot against the poll and upserts the voter's single row.
    async fn record_vote(&self, ballot: &Ballot, now: DateTime<Utc>) -> PollResult<VoteOutcome>;

    /// Closes every active poll whose expiry has passed, returning their ids.
    async fn close_expired(&self, now: DateTime<Utc>) -> PollResult<Vec<PollId>>;

    async fn ping(&self) -> PollResult<()>;
}

pub async fn new_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    new_pool_with(database_url.parse()?, max_connections).await
}

pub async fn new_pool_with(
    connect_options: PgConnectOptions,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(connect_options)
        .await
}
