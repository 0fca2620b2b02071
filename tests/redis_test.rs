use actix::prelude::*;
use chrono::Utc;
use futures::future::join_all;
use livepoll_server::{
    bus::{Backoff, FanoutBus, PollUpdate, RedisBus},
    cache::{CacheStore, RedisCache},
    config::RateRule,
    db::poll::{OptionId, OptionTally, Poll, PollId, ReadModel, VoterId},
    ratelimit::{Bucket, RateLimiter, RedisCounter},
};
use std::sync::Arc;
use std::time::Duration;

mod integration_redis;

use integration_redis::Collector;

fn update(poll_id: PollId, revision: i64) -> PollUpdate {
    PollUpdate(ReadModel::new(
        Poll {
            id: poll_id,
            title: "Over the wire".to_owned(),
            description: None,
            created_by: VoterId("creator".to_owned()),
            created_at: Utc::now(),
            expires_at: None,
            is_active: true,
            revision,
        },
        vec![OptionTally {
            id: OptionId::new(),
            text: "yes".to_owned(),
            votes: revision,
        }],
    ))
}

async fn wait_for(collector: &Collector, count: usize) -> bool {
    for _ in 0..20 {
        if collector.received.lock().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[actix_rt::test]
async fn test_redis_counter_admits_exactly_the_ceiling() {
    let (_, connection) = match integration_redis::connect().await {
        Some(redis) => redis,
        None => return,
    };
    let limiter = RateLimiter::new(
        Arc::new(RedisCounter::new(connection)),
        RateRule {
            max: 5,
            window: Duration::from_secs(10),
        },
        RateRule {
            max: 100,
            window: Duration::from_secs(60),
        },
        Duration::from_secs(2),
    );
    let voter = integration_redis::namespace();

    let results = join_all((0..20).map(|_| limiter.allow(&voter, Bucket::Vote))).await;
    assert_eq!(results.iter().filter(|allowed| **allowed).count(), 5);
    assert!(limiter.allow(&voter, Bucket::Api).await);
}

#[actix_rt::test]
async fn test_redis_counter_window_expires() {
    let (_, connection) = match integration_redis::connect().await {
        Some(redis) => redis,
        None => return,
    };
    let limiter = RateLimiter::new(
        Arc::new(RedisCounter::new(connection)),
        RateRule {
            max: 1,
            window: Duration::from_millis(100),
        },
        RateRule {
            max: 1,
            window: Duration::from_millis(100),
        },
        Duration::from_secs(2),
    );
    let voter = integration_redis::namespace();

    assert!(limiter.allow(&voter, Bucket::Vote).await);
    assert!(!limiter.allow(&voter, Bucket::Vote).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(limiter.allow(&voter, Bucket::Vote).await);
}

#[actix_rt::test]
async fn test_redis_cache_refuses_fills_below_floor() {
    let (_, connection) = match integration_redis::connect().await {
        Some(redis) => redis,
        None => return,
    };
    let cache = RedisCache::new(connection);
    let key = integration_redis::namespace();
    let ttl = Duration::from_secs(30);

    assert_eq!(cache.get(&key).await.unwrap(), None);
    assert!(cache.set_at(&key, "r1".to_owned(), 1, ttl).await.unwrap());
    assert_eq!(cache.get(&key).await.unwrap(), Some("r1".to_owned()));

    cache.del_at(&key, Some(3), ttl).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), None);
    assert!(!cache.set_at(&key, "r2".to_owned(), 2, ttl).await.unwrap());
    assert_eq!(cache.get(&key).await.unwrap(), None);

    // A lower revision never lowers the floor, a plain delete leaves it
    cache.del_at(&key, Some(2), ttl).await.unwrap();
    cache.del_at(&key, None, ttl).await.unwrap();
    assert!(!cache.set_at(&key, "r2".to_owned(), 2, ttl).await.unwrap());
    assert!(cache.set_at(&key, "r3".to_owned(), 3, ttl).await.unwrap());
    assert_eq!(cache.get(&key).await.unwrap(), Some("r3".to_owned()));

    cache
        .set_at(&key, "short".to_owned(), 4, Duration::from_millis(100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.get(&key).await.unwrap(), None);
}

// One test for the whole subscriber lifecycle, since killing pub/sub
// connections would disturb any other bus test running alongside.
#[actix_rt::test]
async fn test_redis_bus_subscription_lifecycle() {
    let (client, mut connection) = match integration_redis::connect().await {
        Some(redis) => redis,
        None => return,
    };
    let backoff = Backoff {
        base: Duration::from_millis(50),
        max: Duration::from_millis(200),
        max_retries: None,
    };
    let viewer = Collector::default();
    let viewer_bus = RedisBus::start(
        client.clone(),
        connection.clone(),
        backoff.clone(),
        viewer.clone().start().recipient(),
    );
    let publisher = Collector::default();
    let publisher_bus = RedisBus::start(
        client,
        connection.clone(),
        backoff,
        publisher.clone().start().recipient(),
    );
    let poll_id = PollId::new();

    // Published right after subscribe returns, with no grace period
    viewer_bus.subscribe(poll_id).await.unwrap();
    let first = update(poll_id, 1);
    publisher_bus.publish(&first).await.unwrap();
    assert!(wait_for(&viewer, 1).await);
    assert_eq!(viewer.received.lock()[0], first);
    assert!(publisher.received.lock().is_empty());

    // Subscribing twice is acknowledged without a second subscription
    viewer_bus.subscribe(poll_id).await.unwrap();

    // Drops every pub/sub connection on the server, ours included
    let _: i64 = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("pubsub")
        .query_async(&mut connection)
        .await
        .unwrap();

    let mut restored = false;
    for revision in 2..=40 {
        publisher_bus.publish(&update(poll_id, revision)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        if viewer.received.lock().len() > 1 {
            restored = true;
            break;
        }
    }
    assert!(restored, "subscription was not restored");

    viewer_bus.unsubscribe(poll_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = viewer.received.lock().len();
    publisher_bus.publish(&update(poll_id, 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(viewer.received.lock().len(), seen);
}
