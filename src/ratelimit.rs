use crate::config::RateRule;
use crate::error::{bounded, PollError, PollResult};
use crate::metrics::RATE_LIMIT_EXCEEDED;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// INCR and the window expiry have to land together, otherwise two
// instances racing on a fresh key could both see a counter without a TTL.
const HIT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    Vote,
    Api,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Vote => "vote",
            Bucket::Api => "api",
        }
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments the counter for `key` and returns the new value. A counter
    /// created by this call expires after `window`.
    async fn hit(&self, key: &str, window: Duration) -> PollResult<u64>;
}

pub struct RedisCounter {
    connection: ConnectionManager,
    script: Script,
}

impl RedisCounter {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(HIT_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounter {
    async fn hit(&self, key: &str, window: Duration) -> PollResult<u64> {
        let mut connection = self.connection.clone();
        let count: u64 = self
            .script
            .key(key)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut connection)
            .await?;
        Ok(count)
    }
}

/// Hits between sweeps of closed windows.
const PRUNE_EVERY: usize = 256;

#[derive(Default)]
struct Windows {
    counters: HashMap<String, (u64, Instant)>,
    hits: usize,
}

#[derive(Default)]
pub struct MemoryCounter {
    windows: Mutex<Windows>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters held in memory, closed windows included.
    pub fn tracked(&self) -> usize {
        self.windows.lock().counters.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounter {
    async fn hit(&self, key: &str, window: Duration) -> PollResult<u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.hits = windows.hits.wrapping_add(1);
        if windows.hits % PRUNE_EVERY == 0 {
            windows.counters.retain(|_, (_, deadline)| *deadline > now);
        }
        let entry = windows
            .counters
            .entry(key.to_owned())
            .or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// Fixed window admission control shared by every instance through the
/// counter store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    vote: RateRule,
    api: RateRule,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, vote: RateRule, api: RateRule, timeout: Duration) -> Self {
        Self {
            store,
            vote,
            api,
            timeout,
        }
    }

    fn rule(&self, bucket: Bucket) -> &RateRule {
        match bucket {
            Bucket::Vote => &self.vote,
            Bucket::Api => &self.api,
        }
    }

    pub async fn allow(&self, identity: &str, bucket: Bucket) -> bool {
        let rule = self.rule(bucket);
        let key = format!("ratelimit:{}:{}", bucket.as_str(), identity);
        match bounded(self.timeout, "rate limit", self.store.hit(&key, rule.window)).await {
            Ok(count) if count <= rule.max => true,
            Ok(count) => {
                debug!(bucket = bucket.as_str(), identity, count, "Rate limit exceeded");
                RATE_LIMIT_EXCEEDED.with_label_values(&[bucket.as_str()]).inc();
                false
            }
            Err(err) => {
                warn!(
                    bucket = bucket.as_str(),
                    "Rate limit store unavailable, allowing request: {err}"
                );
                true
            }
        }
    }

    pub async fn check(&self, identity: &str, bucket: Bucket) -> PollResult<()> {
        if self.allow(identity, bucket).await {
            Ok(())
        } else {
            Err(PollError::RateLimited)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    struct Unreachable;

    #[async_trait]
    impl CounterStore for Unreachable {
        async fn hit(&self, _key: &str, _window: Duration) -> PollResult<u64> {
            Err(PollError::Transient("connection refused".to_owned()))
        }
    }

    fn limiter(store: Arc<dyn CounterStore>, max: u64, window: Duration) -> RateLimiter {
        RateLimiter::new(
            store,
            RateRule { max, window },
            RateRule {
                max: 100,
                window: Duration::from_secs(60),
            },
            Duration::from_secs(1),
        )
    }

    #[actix_rt::test]
    async fn concurrent_hits_admit_exactly_the_ceiling() {
        let limiter = limiter(Arc::new(MemoryCounter::new()), 5, Duration::from_secs(10));
        let results = join_all((0..20).map(|_| limiter.allow("voter", Bucket::Vote))).await;
        assert_eq!(results.iter().filter(|allowed| **allowed).count(), 5);

        // Other identities and buckets have their own counters.
        assert!(limiter.allow("someone-else", Bucket::Vote).await);
        assert!(limiter.allow("voter", Bucket::Api).await);
    }

    #[actix_rt::test]
    async fn window_resets_after_expiry() {
        let limiter = limiter(Arc::new(MemoryCounter::new()), 1, Duration::from_millis(50));
        assert!(limiter.allow("voter", Bucket::Vote).await);
        assert_eq!(
            limiter.check("voter", Bucket::Vote).await,
            Err(PollError::RateLimited)
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.allow("voter", Bucket::Vote).await);
    }

    #[actix_rt::test]
    async fn closed_windows_are_pruned() {
        let counter = MemoryCounter::new();
        let short = Duration::from_millis(20);
        for i in 0..PRUNE_EVERY - 1 {
            counter.hit(&format!("ip:{i}"), short).await.unwrap();
        }
        assert_eq!(counter.tracked(), PRUNE_EVERY - 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        counter.hit("ip:fresh", Duration::from_secs(10)).await.unwrap();
        assert_eq!(counter.tracked(), 1);
    }

    #[actix_rt::test]
    async fn fails_open_when_store_is_down() {
        let limiter = limiter(Arc::new(Unreachable), 0, Duration::from_secs(1));
        assert!(limiter.allow("voter", Bucket::Vote).await);
    }
}
