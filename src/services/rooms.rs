use crate::bus::{FanoutBus, PollUpdate};
use crate::db::poll::PollId;
use crate::error::bounded;
use crate::message_handler_with_span;
use crate::span::SpanHandler;
use crate::websocket::{Shutdown, WsClient};
use actix::prelude::*;
use actix_interop::FutureInterop;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Span};
use tracing_futures::Instrument;

#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Connect {
    pub client: Addr<WsClient>,
}

#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Join {
    pub poll_id: PollId,
    pub client: Addr<WsClient>,
}

#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Leave {
    pub poll_id: PollId,
    pub client: Addr<WsClient>,
}

#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub client: Addr<WsClient>,
}

impl fmt::Debug for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Join").field("poll_id", &self.poll_id).finish()
    }
}

/// Closes every local connection. Returns how many were closed.
#[derive(Message)]
#[rtype(result = "usize")]
pub struct Drain;

#[derive(Message)]
#[rtype(result = "usize")]
pub struct RoomSize(pub PollId);

#[derive(Message)]
#[rtype(result = "usize")]
pub struct ConnectionCount;

/// Resolves once the room's topic is subscribed, or the attempt has failed.
type Subscription = Shared<BoxFuture<'static, ()>>;

fn subscribe(bus: Arc<dyn FanoutBus>, timeout: Duration, poll_id: PollId) -> Subscription {
    async move {
        if let Err(err) = bounded(timeout, "bus subscribe", bus.subscribe(poll_id)).await {
            warn!(poll_id = %poll_id, "Failed to subscribe to poll topic: {err}");
        }
    }
    .boxed()
    .shared()
}

struct Room {
    members: HashSet<Addr<WsClient>>,
    last_revision: Option<i64>,
    subscribed: Subscription,
}

/// Local room membership and relay of bus updates to room members.
pub struct RoomActor {
    bus: Arc<dyn FanoutBus>,
    clients: HashSet<Addr<WsClient>>,
    rooms: HashMap<PollId, Room>,
    timeout: Duration,
}

impl RoomActor {
    pub fn new(bus: Arc<dyn FanoutBus>, timeout: Duration) -> Self {
        Self {
            bus,
            clients: HashSet::new(),
            rooms: HashMap::new(),
            timeout,
        }
    }

    fn unsubscribe(&self, poll_id: PollId, ctx: &mut Context<Self>) {
        let bus = self.bus.clone();
        let timeout = self.timeout;
        ctx.spawn(
            async move {
                if let Err(err) = bounded(timeout, "bus unsubscribe", bus.unsubscribe(poll_id)).await {
                    warn!(poll_id = %poll_id, "Failed to unsubscribe from poll topic: {err}");
                }
            }
            .into_actor(self),
        );
    }

    /// Removes a member, dropping the room and its topic once empty.
    fn remove(&mut self, poll_id: PollId, client: &Addr<WsClient>, ctx: &mut Context<Self>) {
        let emptied = match self.rooms.get_mut(&poll_id) {
            Some(room) => room.members.remove(client) && room.members.is_empty(),
            None => false,
        };
        if emptied {
            self.rooms.remove(&poll_id);
            debug!(poll_id = %poll_id, "Room empty, unsubscribing");
            self.unsubscribe(poll_id, ctx);
        }
    }
}

impl Actor for RoomActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Room actor started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Room actor stopped");
    }
}

message_handler_with_span! {
    impl SpanHandler<Connect> for RoomActor {
        type Result = ();

        fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self>, _span: Span) -> Self::Result {
            self.clients.insert(msg.client);
            debug!(clients = self.clients.len(), "Client connected");
        }
    }
}

message_handler_with_span! {
    impl SpanHandler<Join> for RoomActor {
        type Result = ResponseActFuture<Self, ()>;

        fn handle(&mut self, msg: Join, _ctx: &mut Context<Self>, span: Span) -> Self::Result {
            let Join { poll_id, client } = msg;
            let room = match self.rooms.entry(poll_id) {
                Entry::Occupied(room) => room.into_mut(),
                Entry::Vacant(slot) => slot.insert(Room {
                    members: HashSet::new(),
                    last_revision: None,
                    subscribed: subscribe(self.bus.clone(), self.timeout, poll_id),
                }),
            };
            room.members.insert(client);
            debug!(poll_id = %poll_id, members = room.members.len(), "Joined room");

            // Every joiner waits for the topic subscription, so its initial
            // read can't miss an update.
            room.subscribed
                .clone()
                .instrument(span)
                .interop_actor_boxed(self)
        }
    }
}

message_handler_with_span! {
    impl SpanHandler<Leave> for RoomActor {
        type Result = ();

        fn handle(&mut self, msg: Leave, ctx: &mut Context<Self>, _span: Span) -> Self::Result {
            debug!(poll_id = %msg.poll_id, "Leaving room");
            self.remove(msg.poll_id, &msg.client, ctx);
        }
    }
}

message_handler_with_span! {
    impl SpanHandler<Disconnect> for RoomActor {
        type Result = ();

        fn handle(&mut self, msg: Disconnect, ctx: &mut Context<Self>, _span: Span) -> Self::Result {
            self.clients.remove(&msg.client);
            let joined: Vec<PollId> = self
                .rooms
                .iter()
                .filter(|(_, room)| room.members.contains(&msg.client))
                .map(|(poll_id, _)| *poll_id)
                .collect();
            debug!(rooms = joined.len(), "Removing disconnected client from rooms");
            for poll_id in joined {
                self.remove(poll_id, &msg.client, ctx);
            }
        }
    }
}

impl Handler<PollUpdate> for RoomActor {
    type Result = ();

    fn handle(&mut self, msg: PollUpdate, _ctx: &mut Context<Self>) -> Self::Result {
        let poll_id = msg.poll_id();
        let revision = msg.revision();
        let room = match self.rooms.get_mut(&poll_id) {
            Some(room) => room,
            None => {
                debug!(poll_id = %poll_id, "Update for a room with no local members");
                return;
            }
        };
        if room.last_revision.map_or(false, |last| last >= revision) {
            debug!(poll_id = %poll_id, revision, "Dropping stale or duplicate update");
            return;
        }
        room.last_revision = Some(revision);
        debug!(
            poll_id = %poll_id,
            revision,
            clients = room.members.len(),
            "Relaying update to room"
        );
        for client in &room.members {
            client.do_send(msg.clone());
        }
    }
}

impl Handler<Drain> for RoomActor {
    type Result = usize;

    fn handle(&mut self, _msg: Drain, ctx: &mut Context<Self>) -> Self::Result {
        let clients = std::mem::take(&mut self.clients);
        info!(clients = clients.len(), "Draining connections");
        for client in &clients {
            client.do_send(Shutdown);
        }
        let polls: Vec<PollId> = self.rooms.drain().map(|(poll_id, _)| poll_id).collect();
        for poll_id in polls {
            self.unsubscribe(poll_id, ctx);
        }
        clients.len()
    }
}

impl Handler<RoomSize> for RoomActor {
    type Result = usize;

    fn handle(&mut self, msg: RoomSize, _ctx: &mut Context<Self>) -> Self::Result {
        self.rooms
            .get(&msg.0)
            .map_or(0, |room| room.members.len())
    }
}

impl Handler<ConnectionCount> for RoomActor {
    type Result = usize;

    fn handle(&mut self, _msg: ConnectionCount, _ctx: &mut Context<Self>) -> Self::Result {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::poll::VoterId;
    use crate::error::PollResult;
    use crate::services::connection::ConnectionState;
    use crate::services::{AppState, Backends};
    use crate::span::SpanMessage;
    use actix_web::{error::PayloadError, web::Bytes};
    use actix_web_actors::ws;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Bus whose subscriptions take a while to be confirmed.
    #[derive(Default)]
    struct SlowBus {
        subscribe_calls: AtomicUsize,
        subscribed: AtomicBool,
    }

    #[async_trait]
    impl FanoutBus for SlowBus {
        async fn publish(&self, _update: &PollUpdate) -> PollResult<()> {
            Ok(())
        }

        async fn subscribe(&self, _poll: PollId) -> PollResult<()> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.subscribed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn unsubscribe(&self, _poll: PollId) -> PollResult<()> {
            Ok(())
        }
    }

    fn client(state: &AppState, voter: &str) -> Addr<WsClient> {
        let connection = ConnectionState::Connecting
            .authenticate(VoterId(voter.to_owned()))
            .unwrap();
        let actor = WsClient::new(
            connection,
            state.polls.clone(),
            state.limiter.clone(),
            state.rooms.clone(),
        );
        let (addr, _frames) = ws::WebsocketContext::create_with_addr(
            actor,
            futures::stream::pending::<Result<Bytes, PayloadError>>(),
        );
        addr
    }

    #[actix_rt::test]
    async fn every_joiner_waits_for_the_subscription() {
        let state = AppState::start(&Config::local("secret"), Backends::in_memory());
        let bus = Arc::new(SlowBus::default());
        let rooms = RoomActor::new(bus.clone(), Duration::from_secs(1)).start();
        let poll_id = PollId::new();

        let first = async {
            rooms
                .send(SpanMessage::new(Join {
                    poll_id,
                    client: client(&state, "alice"),
                }))
                .await
                .unwrap();
            bus.subscribed.load(Ordering::SeqCst)
        };
        let second = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            rooms
                .send(SpanMessage::new(Join {
                    poll_id,
                    client: client(&state, "bob"),
                }))
                .await
                .unwrap();
            bus.subscribed.load(Ordering::SeqCst)
        };
        let (first_saw_subscription, second_saw_subscription) = futures::join!(first, second);

        assert!(first_saw_subscription);
        assert!(second_saw_subscription);
        assert_eq!(bus.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rooms.send(RoomSize(poll_id)).await.unwrap(), 2);
    }
}
