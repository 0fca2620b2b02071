use super::{topic, Backoff, FanoutBus, PollUpdate, SubscriberState};
use crate::db::poll::PollId;
use crate::error::{PollError, PollResult};
use actix::prelude::*;
use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, aio::PubSub, AsyncCommands, Client, RedisError};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Ack = oneshot::Sender<()>;

#[derive(Debug)]
enum Command {
    /// Acknowledged once the channel is subscribed on the live connection.
    Subscribe(PollId, Ack),
    Unsubscribe(PollId),
}

/// Redis pub/sub fan-out. Publishing goes through the shared connection
/// manager; receiving runs on a dedicated subscriber connection owned by a
/// background task.
pub struct RedisBus {
    connection: ConnectionManager,
    commands: mpsc::UnboundedSender<Command>,
}

impl RedisBus {
    pub fn start(
        client: Client,
        connection: ConnectionManager,
        backoff: Backoff,
        deliver: Recipient<PollUpdate>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        actix_rt::spawn(run_subscriber(client, backoff, receiver, deliver));
        Self {
            connection,
            commands,
        }
    }

    fn send(&self, command: Command) -> PollResult<()> {
        self.commands
            .send(command)
            .map_err(|_| PollError::Transient("bus subscriber stopped".to_owned()))
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn publish(&self, update: &PollUpdate) -> PollResult<()> {
        let payload = serde_json::to_string(update)?;
        let mut connection = self.connection.clone();
        connection
            .publish::<_, _, ()>(topic(update.poll_id()), payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, poll: PollId) -> PollResult<()> {
        let (ack, subscribed) = oneshot::channel();
        self.send(Command::Subscribe(poll, ack))?;
        subscribed
            .await
            .map_err(|_| PollError::Transient("bus subscription lost".to_owned()))
    }

    async fn unsubscribe(&self, poll: PollId) -> PollResult<()> {
        self.send(Command::Unsubscribe(poll))
    }
}

enum Event {
    Message(Option<redis::Msg>),
    Command(Option<Command>),
}

enum PumpEnd {
    Closed,
    Disconnected(String),
}

fn apply(topics: &mut HashSet<PollId>, command: &Command) -> bool {
    match command {
        Command::Subscribe(poll, _) => topics.insert(*poll),
        Command::Unsubscribe(poll) => topics.remove(poll),
    }
}

fn acknowledge(acks: impl IntoIterator<Item = Ack>) {
    for ack in acks {
        // The joiner may have timed out already.
        let _ = ack.send(());
    }
}

async fn run_subscriber(
    client: Client,
    backoff: Backoff,
    mut commands: mpsc::UnboundedReceiver<Command>,
    deliver: Recipient<PollUpdate>,
) {
    let mut topics: HashSet<PollId> = HashSet::new();
    let mut pending: Vec<Ack> = Vec::new();
    let mut state = SubscriberState::Connecting { failures: 0 };
    loop {
        state = match state {
            SubscriberState::Connecting { failures } => {
                // Fold whatever queued up while we were offline. Their acks
                // wait for the connection that subscribes them.
                while let Ok(command) = commands.try_recv() {
                    apply(&mut topics, &command);
                    if let Command::Subscribe(_, ack) = command {
                        pending.push(ack);
                    }
                }
                match open(&client, &topics).await {
                    Ok(pubsub) => {
                        let state = SubscriberState::Connecting { failures }.on_connected();
                        info!(topics = topics.len(), "Bus subscriber connected");
                        acknowledge(pending.drain(..));
                        match pump(pubsub, &mut topics, &mut commands, &deliver).await {
                            PumpEnd::Closed => {
                                debug!("Bus dropped, stopping subscriber");
                                return;
                            }
                            PumpEnd::Disconnected(reason) => {
                                warn!("Bus subscription lost: {reason}");
                                state.on_failure(&backoff)
                            }
                        }
                    }
                    Err(err) => {
                        warn!(failures, "Bus subscriber failed to connect: {err}");
                        SubscriberState::Connecting { failures }.on_failure(&backoff)
                    }
                }
            }
            SubscriberState::Backoff { delay, .. } => {
                debug!("Reconnecting bus subscriber in {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
                state.on_retry()
            }
            SubscriberState::Subscribed => SubscriberState::Connecting { failures: 0 },
            SubscriberState::GaveUp => {
                error!("Bus subscriber gave up reconnecting, live updates limited to this instance");
                return;
            }
        };
    }
}

async fn open(client: &Client, topics: &HashSet<PollId>) -> Result<PubSub, RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    for poll in topics {
        pubsub.subscribe(topic(*poll)).await?;
    }
    Ok(pubsub)
}

async fn pump(
    mut pubsub: PubSub,
    topics: &mut HashSet<PollId>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    deliver: &Recipient<PollUpdate>,
) -> PumpEnd {
    loop {
        let event = {
            let mut messages = Box::pin(pubsub.on_message());
            tokio::select! {
                message = messages.next() => Event::Message(message),
                command = commands.recv() => Event::Command(command),
            }
        };
        match event {
            Event::Message(Some(message)) => {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("Unreadable bus payload: {err}");
                        continue;
                    }
                };
                match serde_json::from_str::<PollUpdate>(&payload) {
                    Ok(update) => deliver.do_send(update),
                    Err(err) => warn!(
                        channel = message.get_channel_name(),
                        "Dropping malformed poll update: {err}"
                    ),
                }
            }
            Event::Message(None) => return PumpEnd::Disconnected("stream ended".to_owned()),
            Event::Command(Some(command)) => {
                let changed = apply(topics, &command);
                let (result, ack) = match command {
                    Command::Subscribe(poll, ack) if changed => {
                        (pubsub.subscribe(topic(poll)).await, Some(ack))
                    }
                    Command::Subscribe(_, ack) => (Ok(()), Some(ack)),
                    Command::Unsubscribe(poll) if changed => {
                        (pubsub.unsubscribe(topic(poll)).await, None)
                    }
                    Command::Unsubscribe(_) => (Ok(()), None),
                };
                // A failed ack is dropped, which the subscriber sees as an error.
                if let Err(err) = result {
                    return PumpEnd::Disconnected(err.to_string());
                }
                acknowledge(ack);
                if changed {
                    debug!("Bus subscription updated");
                }
            }
            Event::Command(None) => return PumpEnd::Closed,
        }
    }
}
