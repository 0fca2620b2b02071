use crate::auth::TokenVerifier;
use crate::bus::{Backoff, FanoutBus, LocalHub, PollUpdate, RedisBus};
use crate::cache::{CacheStore, MemoryCache, PollCache, RedisCache, TtlPolicy};
use crate::config::Config;
use crate::db::{self, MemoryStore, PgStore, PollStore};
use crate::error::PollResult;
use crate::kv;
use crate::ratelimit::{CounterStore, MemoryCounter, RateLimiter, RedisCounter};
use actix::prelude::*;
use redis::{aio::ConnectionManager, Client};
use rooms::RoomActor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod connection;
pub mod poll;
pub mod rooms;
pub mod sweeper;
pub mod vote;

/// Poll reads, creation and vote admission on top of the store, the cache
/// and the fan-out bus.
pub struct PollService {
    store: Arc<dyn PollStore>,
    cache: PollCache,
    bus: Arc<dyn FanoutBus>,
    rooms: Addr<RoomActor>,
    timeout: Duration,
}

impl PollService {
    pub fn store(&self) -> &Arc<dyn PollStore> {
        &self.store
    }
}

pub enum BusBackend {
    Local(LocalHub),
    Redis {
        client: Client,
        connection: ConnectionManager,
    },
}

/// Shared collaborators of a service instance. Several instances built from
/// clones of the same backends behave like separate processes sharing one
/// database and one Redis.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn PollStore>,
    pub cache: Arc<dyn CacheStore>,
    pub counters: Arc<dyn CounterStore>,
    pub bus: Arc<BusBackend>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            cache: Arc::new(MemoryCache::new()),
            counters: Arc::new(MemoryCounter::new()),
            bus: Arc::new(BusBackend::Local(LocalHub::new())),
        }
    }

    /// Connects to Postgres and Redis when configured, falling back to
    /// in-process backends for whichever is not.
    pub async fn connect(config: &Config) -> color_eyre::Result<Self> {
        let mut backends = Self::in_memory();

        match &config.database_url {
            Some(url) => {
                let store = PgStore(db::new_pool(url, config.db_max_connections).await?);
                store.migrate().await?;
                info!("Using Postgres poll store");
                backends.store = Arc::new(store);
            }
            None => warn!("DATABASE_URL not set, polls are kept in memory"),
        }

        match &config.redis_url {
            Some(url) => {
                let (client, connection) = kv::connect(url).await?;
                backends.cache = Arc::new(RedisCache::new(connection.clone()));
                backends.counters = Arc::new(RedisCounter::new(connection.clone()));
                backends.bus = Arc::new(BusBackend::Redis { client, connection });
            }
            None => warn!("REDIS_URL not set, cache, rate limits and fan-out are local"),
        }

        Ok(backends)
    }
}

/// Process scoped state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub polls: Arc<PollService>,
    pub limiter: Arc<RateLimiter>,
    pub verifier: Arc<TokenVerifier>,
    pub rooms: Addr<RoomActor>,
}

impl AppState {
    /// Starts the room actor and its bus subscription. Must run inside an
    /// actix system.
    pub fn start(config: &Config, backends: Backends) -> Self {
        let backoff = Backoff {
            base: config.bus_backoff_base,
            max: config.bus_backoff_max,
            max_retries: config.bus_max_retries,
        };
        let timeout = config.io_timeout;

        // The bus needs the room actor's address before the actor exists.
        let ctx = Context::<RoomActor>::new();
        let deliver = ctx.address().recipient::<PollUpdate>();
        let bus: Arc<dyn FanoutBus> = match backends.bus.as_ref() {
            BusBackend::Local(hub) => Arc::new(hub.attach(deliver)),
            BusBackend::Redis { client, connection } => Arc::new(RedisBus::start(
                client.clone(),
                connection.clone(),
                backoff,
                deliver,
            )),
        };
        let rooms = ctx.run(RoomActor::new(bus.clone(), timeout));

        let cache = PollCache::new(
            backends.cache,
            TtlPolicy {
                active: config.cache_ttl_active,
                closed: config.cache_ttl_closed,
            },
            timeout,
        );
        let polls = PollService {
            store: backends.store,
            cache,
            bus,
            rooms: rooms.clone(),
            timeout,
        };
        let limiter = RateLimiter::new(
            backends.counters,
            config.vote_rate.clone(),
            config.api_rate.clone(),
            timeout,
        );

        Self {
            polls: Arc::new(polls),
            limiter: Arc::new(limiter),
            verifier: Arc::new(TokenVerifier::new(&config.jwt_secret)),
            rooms,
        }
    }

    pub async fn health(&self) -> PollResult<()> {
        self.polls.ping().await
    }
}
