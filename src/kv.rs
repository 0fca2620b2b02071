//! # Redis
//!
//! Shared in-memory store used by every service instance for three things:
//!
//! - read model cache entries (`poll:{id}`, TTL'd strings)
//! - rate limit counters (`ratelimit:{bucket}:{identity}`, atomic `INCR`)
//! - the fan-out channels (`poll-updates:{id}`, pub/sub)
//!
//! Nothing here is durable. Losing Redis degrades the service to store-only
//! reads, open rate limits and local-only fan-out, never to wrong vote counts.
use redis::{aio::ConnectionManager, Client};
use tracing::info;

pub async fn connect(redis_url: &str) -> Result<(Client, ConnectionManager), redis::RedisError> {
    let client = Client::open(redis_url)?;
    let connection_manager = ConnectionManager::new(client.clone()).await?;
    info!("Connected to Redis");
    Ok((client, connection_manager))
}
