use super::PollService;
use crate::async_message_handler_with_span;
use crate::db::poll::PollId;
use crate::error::PollResult;
use crate::span::{AsyncSpanHandler, SpanMessage};
use actix::prelude::*;
use actix_interop::with_ctx;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Run one sweep now. Returns the ids of the polls it closed.
#[derive(Message)]
#[rtype(result = "PollResult<Vec<PollId>>")]
pub struct Sweep;

/// Periodically closes polls whose expiry has passed and evicts them from
/// the cache. Runs once as soon as it starts.
pub struct SweeperActor {
    polls: Arc<PollService>,
    interval: Duration,
}

impl SweeperActor {
    pub fn new(polls: Arc<PollService>, interval: Duration) -> Self {
        Self { polls, interval }
    }
}

impl Actor for SweeperActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Expiration sweeper started"
        );
        ctx.notify(SpanMessage::new(Sweep));
        ctx.run_interval(self.interval, |_, ctx| {
            ctx.notify(SpanMessage::new(Sweep));
        });
    }
}

async_message_handler_with_span! {
    impl AsyncSpanHandler<Sweep> for SweeperActor {
        async fn handle(_msg: Sweep) -> PollResult<Vec<PollId>> {
            let polls = with_ctx(|actor: &mut SweeperActor, _| actor.polls.clone());
            match polls.close_expired().await {
                Ok(closed) if closed.is_empty() => {
                    debug!("No expired polls");
                    Ok(closed)
                }
                Ok(closed) => {
                    info!(count = closed.len(), "Closed expired polls");
                    Ok(closed)
                }
                Err(err) => {
                    error!("Expiration sweep failed: {err}");
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::poll::{NewPoll, VoterId};
    use crate::services::{AppState, Backends};
    use chrono::Utc;

    fn draft(expires_at: Option<chrono::DateTime<Utc>>) -> NewPoll {
        NewPoll {
            title: "Soon over".to_owned(),
            description: None,
            options: vec!["yes".to_owned(), "no".to_owned()],
            created_by: VoterId("creator".to_owned()),
            expires_at,
        }
    }

    #[actix_rt::test]
    async fn sweep_closes_only_expired_polls_once() {
        let state = AppState::start(&Config::local("secret"), Backends::in_memory());
        let short = state
            .polls
            .create_poll(draft(Some(Utc::now() + chrono::Duration::milliseconds(150))))
            .await
            .unwrap();
        let open = state.polls.create_poll(draft(None)).await.unwrap();

        let sweeper = SweeperActor::new(state.polls.clone(), Duration::from_secs(3600)).start();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let closed = sweeper.send(SpanMessage::new(Sweep)).await.unwrap().unwrap();
        assert_eq!(closed, vec![short.id()]);
        let again = sweeper.send(SpanMessage::new(Sweep)).await.unwrap().unwrap();
        assert!(again.is_empty());

        assert!(!state.polls.get_poll(short.id()).await.unwrap().poll.is_active);
        assert!(state.polls.get_poll(open.id()).await.unwrap().poll.is_active);
    }
}
