use super::{floor_key, CacheStore};
use crate::error::PollResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Writes between sweeps of expired entries.
pub(crate) const PRUNE_EVERY: usize = 256;

#[derive(Default)]
struct Entries {
    values: HashMap<String, (String, Instant)>,
    floors: HashMap<String, (i64, Instant)>,
    writes: usize,
}

impl Entries {
    fn floor(&self, key: &str, now: Instant) -> Option<i64> {
        self.floors
            .get(key)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(revision, _)| *revision)
    }

    fn record_write(&mut self, now: Instant) {
        self.writes = self.writes.wrapping_add(1);
        if self.writes % PRUNE_EVERY == 0 {
            self.values.retain(|_, (_, deadline)| *deadline > now);
            self.floors.retain(|_, (_, deadline)| *deadline > now);
        }
    }
}

/// Process-local cache for single instance deployments and tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<Entries>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys held in memory, expired or not.
    pub fn stored(&self) -> usize {
        let entries = self.entries.lock();
        entries.values.len() + entries.floors.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> PollResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = entries
            .values
            .get(key)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(value, _)| value.clone());
        if live.is_none() {
            entries.values.remove(key);
        }
        Ok(live)
    }

    async fn set_at(
        &self,
        key: &str,
        value: String,
        revision: i64,
        ttl: Duration,
    ) -> PollResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.record_write(now);
        if entries
            .floor(&floor_key(key), now)
            .map_or(false, |floor| revision < floor)
        {
            return Ok(false);
        }
        entries.values.insert(key.to_owned(), (value, now + ttl));
        Ok(true)
    }

    async fn del_at(
        &self,
        key: &str,
        revision: Option<i64>,
        floor_ttl: Duration,
    ) -> PollResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.record_write(now);
        entries.values.remove(key);
        if let Some(revision) = revision {
            let floor_key = floor_key(key);
            let raised = entries
                .floor(&floor_key, now)
                .map_or(revision, |floor| floor.max(revision));
            entries.floors.insert(floor_key, (raised, now + floor_ttl));
        }
        Ok(())
    }
}
