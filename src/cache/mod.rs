//! Read cache for poll read models.
//!
//! Cache-aside: entries are written only on a read miss and are deleted,
//! never overwritten, by anything that mutates the poll. A vote also leaves
//! a revision floor behind, and fills older than the floor are refused, so a
//! slow reader can't put back a snapshot from before the vote. The backing
//! store is disposable, so every failure here is logged and treated as a
//! miss.
pub mod memory;
pub mod remote;

use crate::db::poll::{PollId, ReadModel};
use crate::error::{bounded, PollResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use self::memory::MemoryCache;
pub use self::remote::RedisCache;

/// Shared string key-value store with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> PollResult<Option<String>>;

    /// Stores `value` for `ttl` unless the key's revision floor is above
    /// `revision`. Returns whether it was stored.
    async fn set_at(&self, key: &str, value: String, revision: i64, ttl: Duration)
        -> PollResult<bool>;

    /// Deletes `key`. With a revision, also raises the key's floor to it for
    /// `floor_ttl`.
    async fn del_at(&self, key: &str, revision: Option<i64>, floor_ttl: Duration)
        -> PollResult<()>;
}

#[derive(Clone, Debug)]
pub struct TtlPolicy {
    pub active: Duration,
    pub closed: Duration,
}

impl TtlPolicy {
    /// Active polls are kept briefly and never past their own expiry; closed
    /// polls no longer change and can stay much longer.
    pub fn ttl_for(&self, model: &ReadModel, now: DateTime<Utc>) -> Duration {
        if !model.poll.is_active {
            return self.closed;
        }
        match model.poll.expires_at {
            Some(expires_at) => {
                let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
                remaining.min(self.active).max(Duration::from_secs(1))
            }
            None => self.active,
        }
    }
}

pub fn poll_key(id: PollId) -> String {
    format!("poll:{id}")
}

pub(crate) fn floor_key(key: &str) -> String {
    format!("{key}:rev")
}

#[derive(Clone)]
pub struct PollCache {
    store: Arc<dyn CacheStore>,
    ttl: TtlPolicy,
    timeout: Duration,
}

impl PollCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: TtlPolicy, timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout,
        }
    }

    /// Cached model, or `None` on miss, on a stale-active entry, or when the
    /// cache is unreachable.
    pub async fn get(&self, id: PollId, now: DateTime<Utc>) -> Option<ReadModel> {
        let key = poll_key(id);
        let raw = match bounded(self.timeout, "cache get", self.store.get(&key)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(poll_id = %id, "Cache read failed, falling back to store: {err}");
                return None;
            }
        };
        let model: ReadModel = match serde_json::from_str(&raw) {
            Ok(model) => model,
            Err(err) => {
                warn!(poll_id = %id, "Dropping undecodable cache entry: {err}");
                self.invalidate(id).await;
                return None;
            }
        };
        if model.poll.is_active && model.poll.is_expired(now) {
            debug!(poll_id = %id, "Cached poll passed its expiry, treating as miss");
            return None;
        }
        Some(model)
    }

    pub async fn put(&self, model: &ReadModel, now: DateTime<Utc>) {
        let id = model.id();
        let ttl = self.ttl.ttl_for(model, now);
        let raw = match serde_json::to_string(model) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(poll_id = %id, "Failed to encode read model: {err}");
                return;
            }
        };
        let key = poll_key(id);
        let fill = self.store.set_at(&key, raw, model.revision(), ttl);
        match bounded(self.timeout, "cache set", fill).await {
            Ok(true) => {}
            Ok(false) => debug!(
                poll_id = %id,
                revision = model.revision(),
                "Newer write already invalidated this snapshot, not caching"
            ),
            Err(err) => warn!(poll_id = %id, "Cache write failed: {err}"),
        }
    }

    /// Drops the entry.
    pub async fn invalidate(&self, id: PollId) {
        self.drop_entry(id, None).await
    }

    /// Drops the entry and refuses later fills older than `revision`.
    pub async fn invalidate_at(&self, id: PollId, revision: i64) {
        self.drop_entry(id, Some(revision)).await
    }

    async fn drop_entry(&self, id: PollId, revision: Option<i64>) {
        let key = poll_key(id);
        let floor_ttl = self.ttl.active.max(self.ttl.closed);
        match bounded(
            self.timeout,
            "cache del",
            self.store.del_at(&key, revision, floor_ttl),
        )
        .await
        {
            Ok(()) => debug!(poll_id = %id, ?revision, "Invalidated cached poll"),
            Err(err) => warn!(poll_id = %id, "Cache invalidation failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::poll::{OptionId, OptionTally, Poll, VoterId};
    use chrono::Duration as ChronoDuration;

    fn model(is_active: bool, expires_at: Option<DateTime<Utc>>) -> ReadModel {
        ReadModel::new(
            Poll {
                id: PollId::new(),
                title: "Cached".to_owned(),
                description: None,
                created_by: VoterId("creator".to_owned()),
                created_at: Utc::now(),
                expires_at,
                is_active,
                revision: 1,
            },
            vec![OptionTally {
                id: OptionId::new(),
                text: "A".to_owned(),
                votes: 1,
            }],
        )
    }

    fn cache() -> PollCache {
        PollCache::new(
            Arc::new(MemoryCache::new()),
            TtlPolicy {
                active: Duration::from_secs(30),
                closed: Duration::from_secs(3600),
            },
            Duration::from_secs(1),
        )
    }

    #[test]
    fn ttl_is_shorter_for_active_polls() {
        let policy = TtlPolicy {
            active: Duration::from_secs(30),
            closed: Duration::from_secs(3600),
        };
        let now = Utc::now();
        assert_eq!(policy.ttl_for(&model(true, None), now), policy.active);
        assert_eq!(policy.ttl_for(&model(false, None), now), policy.closed);
        let soon = model(true, Some(now + ChronoDuration::seconds(5)));
        assert!(policy.ttl_for(&soon, now) <= Duration::from_secs(5));
    }

    #[actix_rt::test]
    async fn put_get_invalidate() {
        let cache = cache();
        let now = Utc::now();
        let model = model(true, None);

        assert_eq!(cache.get(model.id(), now).await, None);
        cache.put(&model, now).await;
        assert_eq!(cache.get(model.id(), now).await, Some(model.clone()));
        cache.invalidate(model.id()).await;
        assert_eq!(cache.get(model.id(), now).await, None);
    }

    #[actix_rt::test]
    async fn snapshot_older_than_invalidation_is_not_cached() {
        let cache = cache();
        let now = Utc::now();
        let stale = model(true, None);
        let mut fresh = stale.clone();
        fresh.poll.revision = 2;

        cache.invalidate_at(stale.id(), 2).await;
        cache.put(&stale, now).await;
        assert_eq!(cache.get(stale.id(), now).await, None);

        cache.put(&fresh, now).await;
        assert_eq!(cache.get(stale.id(), now).await, Some(fresh));
    }

    #[actix_rt::test]
    async fn expired_active_entry_is_a_miss() {
        let cache = cache();
        let now = Utc::now();
        let model = model(true, Some(now + ChronoDuration::seconds(10)));
        cache.put(&model, now).await;

        let later = now + ChronoDuration::seconds(11);
        assert_eq!(cache.get(model.id(), later).await, None);
    }
}
