use super::PollService;
use crate::db::poll::{NewPoll, PollId, ReadModel};
use crate::error::{bounded, PollError, PollResult};
use crate::metrics::POLLS_CREATED;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::{debug, info, instrument};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

impl PollService {
    /// Read-through: cache first, store snapshot on miss, then repopulate.
    #[instrument(skip(self))]
    pub async fn get_poll(&self, id: PollId) -> PollResult<ReadModel> {
        let now = Utc::now();
        if let Some(model) = self.cache.get(id, now).await {
            debug!("Cache hit");
            return Ok(model);
        }
        let model = self.load_fresh(id, now).await?;
        self.cache.put(&model, now).await;
        Ok(model)
    }

    /// Store snapshot, bypassing the cache entirely.
    pub(crate) async fn load_fresh(&self, id: PollId, now: DateTime<Utc>) -> PollResult<ReadModel> {
        bounded(
            self.timeout,
            "load poll",
            self.store.load_read_model(id, now),
        )
        .await?
        .ok_or(PollError::NotFound)
    }

    #[instrument(skip(self))]
    pub async fn list_polls(
        &self,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> PollResult<Vec<ReadModel>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = offset.unwrap_or(0);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(PollError::invalid(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if offset < 0 {
            return Err(PollError::invalid("offset must not be negative"));
        }
        let ids = bounded(
            self.timeout,
            "list polls",
            self.store.list_poll_ids(limit, offset),
        )
        .await?;
        try_join_all(ids.into_iter().map(|id| self.get_poll(id))).await
    }

    #[instrument(skip(self, poll), fields(title = %poll.title, creator = %poll.created_by))]
    pub async fn create_poll(&self, poll: NewPoll) -> PollResult<ReadModel> {
        let now = Utc::now();
        let poll = poll.validate(now)?;
        let id = bounded(self.timeout, "create poll", self.store.create_poll(poll, now)).await?;
        POLLS_CREATED.inc();
        info!(poll_id = %id, "Poll created");
        self.get_poll(id).await
    }

    /// Closes every poll past its expiry and evicts their cache entries.
    /// Viewers are not notified.
    #[instrument(skip(self))]
    pub async fn close_expired(&self) -> PollResult<Vec<PollId>> {
        let closed = bounded(
            self.timeout,
            "close expired",
            self.store.close_expired(Utc::now()),
        )
        .await?;
        for id in &closed {
            self.cache.invalidate(*id).await;
        }
        Ok(closed)
    }

    pub async fn ping(&self) -> PollResult<()> {
        bounded(self.timeout, "store ping", self.store.ping()).await
    }
}
