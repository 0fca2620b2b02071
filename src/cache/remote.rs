use super::{floor_key, CacheStore};
use crate::error::PollResult;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;

// KEYS: entry, floor. ARGV: value, revision, ttl ms.
const SET_AT_SCRIPT: &str = r#"
local floor = tonumber(redis.call('GET', KEYS[2]) or '-1')
if tonumber(ARGV[2]) < floor then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
return 1
"#;

// KEYS: entry, floor. ARGV: revision or '', floor ttl ms.
const DEL_AT_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
if ARGV[1] ~= '' then
    local floor = tonumber(redis.call('GET', KEYS[2]) or '-1')
    local revision = tonumber(ARGV[1])
    if revision < floor then
        revision = floor
    end
    redis.call('SET', KEYS[2], revision, 'PX', ARGV[2])
end
return 1
"#;

#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    set_at: Script,
    del_at: Script,
}

impl RedisCache {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            set_at: Script::new(SET_AT_SCRIPT),
            del_at: Script::new(DEL_AT_SCRIPT),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> PollResult<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set_at(
        &self,
        key: &str,
        value: String,
        revision: i64,
        ttl: Duration,
    ) -> PollResult<bool> {
        let mut connection = self.connection.clone();
        let stored: i64 = self
            .set_at
            .key(key)
            .key(floor_key(key))
            .arg(value)
            .arg(revision)
            .arg(millis(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(stored == 1)
    }

    async fn del_at(
        &self,
        key: &str,
        revision: Option<i64>,
        floor_ttl: Duration,
    ) -> PollResult<()> {
        let mut connection = self.connection.clone();
        let revision = revision.map(|r| r.to_string()).unwrap_or_default();
        let _: i64 = self
            .del_at
            .key(key)
            .key(floor_key(key))
            .arg(revision)
            .arg(millis(floor_ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }
}
