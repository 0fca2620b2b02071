use super::{
    poll::{NewPoll, OptionId, OptionTally, Poll, PollId, ReadModel},
    vote::{Ballot, VoteId, VoteOutcome},
    PollStore,
};
use crate::error::{PollError, PollResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct PgStore(pub PgPool);

impl PgStore {
    pub fn pool(&self) -> PgPool {
        self.0.clone()
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.0).await
    }
}

#[async_trait]
impl PollStore for PgStore {
    #[instrument(skip(self, poll), fields(title = poll.title.as_str()))]
    async fn create_poll(&self, poll: NewPoll, now: DateTime<Utc>) -> PollResult<PollId> {
        let id = PollId::new();
        let mut tx = self.0.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO polls (id, title, description, created_by, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(&poll.created_by)
        .bind(now)
        .bind(poll.expires_at)
        .execute(&mut *tx)
        .await?;

        for (position, text) in poll.options.iter().enumerate() {
            sqlx::query(
                "INSERT INTO poll_options (id, poll_id, text, position) VALUES ($1, $2, $3, $4)",
            )
            .bind(OptionId::new())
            .bind(id)
            .bind(text)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(poll_id = %id, "Poll created with {} options", poll.options.len());
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn load_read_model(
        &self,
        id: PollId,
        now: DateTime<Utc>,
    ) -> PollResult<Option<ReadModel>> {
        let closed = sqlx::query(
            r#"
            UPDATE polls SET is_active = FALSE, revision = revision + 1
            WHERE id = $1 AND is_active AND expires_at IS NOT NULL AND expires_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.0)
        .await?;
        if closed.rows_affected() > 0 {
            info!(poll_id = %id, "Closed expired poll on read");
        }

        // Poll row and tallies must come from the same snapshot so the
        // revision matches the counts it is sent with.
        let mut tx = self.0.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        let poll = sqlx::query_as::<_, Poll>(
            r#"
            SELECT id, title, description, created_by, created_at, expires_at, is_active, revision
            FROM polls WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let poll = match poll {
            Some(poll) => poll,
            None => return Ok(None),
        };
        let options = sqlx::query_as::<_, OptionTally>(
            r#"
            SELECT o.id, o.text, COUNT(v.id) AS votes
            FROM poll_options o
            LEFT JOIN votes v ON v.option_id = o.id
            WHERE o.poll_id = $1
            GROUP BY o.id, o.text, o.position
            ORDER BY o.position
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(ReadModel::new(poll, options)))
    }

    async fn list_poll_ids(&self, limit: i64, offset: i64) -> PollResult<Vec<PollId>> {
        let rows: Vec<(PollId,)> = sqlx::query_as(
            "SELECT id FROM polls ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.0)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    #[instrument(skip(self), fields(poll_id = %ballot.poll_id, voter = %ballot.voter_id))]
    async fn record_vote(&self, ballot: &Ballot, now: DateTime<Utc>) -> PollResult<VoteOutcome> {
        // Dropping `tx` on any early return rolls the transaction back.
        let mut tx = self.0.begin().await?;

        let poll: Option<(bool, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT is_active, expires_at FROM polls WHERE id = $1 FOR UPDATE")
                .bind(ballot.poll_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (is_active, expires_at) = poll.ok_or(PollError::NotFound)?;
        if !is_active {
            return Err(PollError::PollClosed);
        }
        if expires_at.map_or(false, |expires_at| expires_at <= now) {
            sqlx::query("UPDATE polls SET is_active = FALSE, revision = revision + 1 WHERE id = $1")
                .bind(ballot.poll_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(VoteOutcome::Expired);
        }

        let option: Option<(OptionId,)> =
            sqlx::query_as("SELECT id FROM poll_options WHERE id = $1 AND poll_id = $2")
                .bind(ballot.option_id)
                .bind(ballot.poll_id)
                .fetch_optional(&mut *tx)
                .await?;
        if option.is_none() {
            return Err(PollError::InvalidOption);
        }

        let existing: Option<(OptionId,)> =
            sqlx::query_as("SELECT option_id FROM votes WHERE poll_id = $1 AND voter_id = $2")
                .bind(ballot.poll_id)
                .bind(&ballot.voter_id)
                .fetch_optional(&mut *tx)
                .await?;

        let previous = match existing {
            Some((current,)) if current == ballot.option_id => return Ok(VoteOutcome::Unchanged),
            Some((previous,)) => {
                sqlx::query(
                    "UPDATE votes SET option_id = $1, updated_at = $2 WHERE poll_id = $3 AND voter_id = $4",
                )
                .bind(ballot.option_id)
                .bind(now)
                .bind(ballot.poll_id)
                .bind(&ballot.voter_id)
                .execute(&mut *tx)
                .await?;
                Some(previous)
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO votes (id, poll_id, option_id, voter_id, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $5)
                    ON CONFLICT (poll_id, voter_id)
                    DO UPDATE SET option_id = EXCLUDED.option_id, updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(VoteId::new())
                .bind(ballot.poll_id)
                .bind(ballot.option_id)
                .bind(&ballot.voter_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                None
            }
        };

        let (revision,): (i64,) =
            sqlx::query_as("UPDATE polls SET revision = revision + 1 WHERE id = $1 RETURNING revision")
                .bind(ballot.poll_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        Ok(match previous {
            Some(previous) => VoteOutcome::Changed { previous, revision },
            None => VoteOutcome::Recorded { revision },
        })
    }

    #[instrument(skip(self))]
    async fn close_expired(&self, now: DateTime<Utc>) -> PollResult<Vec<PollId>> {
        let rows: Vec<(PollId,)> = sqlx::query_as(
            r#"
            UPDATE polls SET is_active = FALSE, revision = revision + 1
            WHERE is_active AND expires_at IS NOT NULL AND expires_at <= $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.0)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn ping(&self) -> PollResult<()> {
        sqlx::query("SELECT 1").execute(&self.0).await?;
        Ok(())
    }
}
