//! Topic per poll publish/subscribe between service instances.
//!
//! Any instance may publish a poll's new read model; every instance that has
//! local viewers of that poll is subscribed to its topic and hands the update
//! to its [`crate::services::rooms::RoomActor`]. Delivery is at-least-once and
//! unordered across topics; receivers order updates by revision.
pub mod local;
pub mod remote;

use crate::db::poll::{PollId, ReadModel};
use crate::error::PollResult;
use actix::prelude::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use local::{LocalBus, LocalHub};
pub use remote::RedisBus;

#[derive(Message, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[rtype(result = "()")]
pub struct PollUpdate(pub ReadModel);

impl PollUpdate {
    pub fn poll_id(&self) -> PollId {
        self.0.id()
    }

    pub fn revision(&self) -> i64 {
        self.0.revision()
    }
}

pub fn topic(id: PollId) -> String {
    format!("poll-updates:{id}")
}

#[async_trait]
pub trait FanoutBus: Send + Sync {
    async fn publish(&self, update: &PollUpdate) -> PollResult<()>;
    async fn subscribe(&self, poll: PollId) -> PollResult<()>;
    async fn unsubscribe(&self, poll: PollId) -> PollResult<()>;
}

#[derive(Clone, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: Option<u32>,
}

impl Backoff {
    /// Delay before retry number `attempt` (starting at 1), or `None` once
    /// the retry budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max_retries) = self.max_retries {
            if attempt > max_retries {
                return None;
            }
        }
        let exponent = attempt.saturating_sub(1).min(16);
        Some(self.base.saturating_mul(1 << exponent).min(self.max))
    }
}

/// Lifecycle of the bus subscription connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting { failures: u32 },
    Subscribed,
    Backoff { failures: u32, delay: Duration },
    GaveUp,
}

impl SubscriberState {
    pub fn on_connected(self) -> Self {
        SubscriberState::Subscribed
    }

    pub fn on_failure(self, policy: &Backoff) -> Self {
        let failures = match self {
            SubscriberState::Connecting { failures } => failures + 1,
            SubscriberState::Subscribed => 1,
            SubscriberState::Backoff { failures, .. } => failures + 1,
            SubscriberState::GaveUp => return SubscriberState::GaveUp,
        };
        match policy.delay(failures) {
            Some(delay) => SubscriberState::Backoff { failures, delay },
            None => SubscriberState::GaveUp,
        }
    }

    pub fn on_retry(self) -> Self {
        match self {
            SubscriberState::Backoff { failures, .. } => SubscriberState::Connecting { failures },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: Option<u32>) -> Backoff {
        Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            max_retries,
        }
    }

    #[test]
    fn delay_doubles_and_is_capped() {
        let policy = policy(None);
        assert_eq!(policy.delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay(5), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay(60), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn state_machine_gives_up_after_budget() {
        let policy = policy(Some(2));
        let state = SubscriberState::Connecting { failures: 0 }.on_failure(&policy);
        assert_eq!(
            state,
            SubscriberState::Backoff {
                failures: 1,
                delay: Duration::from_millis(100)
            }
        );
        let state = state.on_retry();
        assert_eq!(state, SubscriberState::Connecting { failures: 1 });
        let state = state.on_failure(&policy).on_retry().on_failure(&policy);
        assert_eq!(state, SubscriberState::GaveUp);
    }

    #[test]
    fn dropped_subscription_starts_a_fresh_backoff() {
        let policy = policy(Some(2));
        let state = SubscriberState::Connecting { failures: 2 }.on_connected();
        assert_eq!(state, SubscriberState::Subscribed);
        assert_eq!(
            state.on_failure(&policy),
            SubscriberState::Backoff {
                failures: 1,
                delay: Duration::from_millis(100)
            }
        );
    }
}
