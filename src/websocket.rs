use crate::bus::PollUpdate;
use crate::db::poll::{OptionId, PollId, ReadModel, VoterId};
use crate::db::vote::Ballot;
use crate::error::PollError;
use crate::metrics::WEBSOCKET_CONNECTIONS;
use crate::ratelimit::{Bucket, RateLimiter};
use crate::services::connection::ConnectionState;
use crate::services::rooms::{Connect, Disconnect, Join, Leave, RoomActor};
use crate::services::PollService;
use crate::span::SpanMessage;
use actix::prelude::*;
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Span};
use tracing_futures::Instrument;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    Join {
        poll_id: PollId,
    },
    Leave {
        poll_id: PollId,
    },
    Vote {
        poll_id: PollId,
        option_id: OptionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voter_id: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Update {
        poll_id: PollId,
        poll: ReadModel,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_id: Option<PollId>,
    },
}

impl OutgoingMessage {
    pub fn error(err: &PollError, poll_id: Option<PollId>) -> Self {
        OutgoingMessage::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
            poll_id,
        }
    }
}

/// Sent by the room actor when the server shuts down.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

type WsClientId = usize;

pub struct WsClient {
    id: WsClientId,
    connection: ConnectionState,
    // Highest revision already sent per poll.
    rendered: HashMap<PollId, i64>,
    polls: Arc<PollService>,
    limiter: Arc<RateLimiter>,
    rooms: Addr<RoomActor>,
    span: Span,
}

impl WsClient {
    /// `connection` must already be authenticated.
    pub fn new(
        connection: ConnectionState,
        polls: Arc<PollService>,
        limiter: Arc<RateLimiter>,
        rooms: Addr<RoomActor>,
    ) -> WsClient {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let voter = connection
            .voter()
            .map(VoterId::to_string)
            .unwrap_or_default();
        WsClient {
            id,
            connection,
            rendered: HashMap::new(),
            polls,
            limiter,
            rooms,
            span: info_span!("ws_client", id, voter = %voter),
        }
    }

    fn send_json<T: Serialize>(&self, ctx: &mut ws::WebsocketContext<Self>, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to convert to JSON {err}"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &PollError, poll_id: Option<PollId>) {
        debug!(code = err.code(), "Sending error to client");
        self.send_json(ctx, &OutgoingMessage::error(err, poll_id));
    }

    /// Sends the model unless this client has already seen it or a newer one.
    fn push(&mut self, ctx: &mut ws::WebsocketContext<Self>, model: ReadModel) {
        let poll_id = model.id();
        let revision = model.revision();
        if self
            .rendered
            .get(&poll_id)
            .map_or(false, |seen| *seen >= revision)
        {
            debug!(poll_id = %poll_id, revision, "Client already has this revision");
            return;
        }
        self.rendered.insert(poll_id, revision);
        self.send_json(ctx, &OutgoingMessage::Update { poll_id, poll: model });
    }

    /// Answers a vote that changed nothing. No update is published for it, so
    /// this is sent even when the revision was already rendered.
    fn reply(&mut self, ctx: &mut ws::WebsocketContext<Self>, model: ReadModel) {
        let poll_id = model.id();
        let revision = model.revision();
        let seen = self.rendered.entry(poll_id).or_insert(revision);
        *seen = (*seen).max(revision);
        self.send_json(ctx, &OutgoingMessage::Update { poll_id, poll: model });
    }

    fn handle_message(&mut self, message: IncomingMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            IncomingMessage::Join { poll_id } => self.join(poll_id, ctx),
            IncomingMessage::Leave { poll_id } => {
                if self.connection.leave(poll_id) {
                    self.rendered.remove(&poll_id);
                    self.rooms.do_send(SpanMessage::new(Leave {
                        poll_id,
                        client: ctx.address(),
                    }));
                }
            }
            IncomingMessage::Vote {
                poll_id,
                option_id,
                voter_id,
            } => self.vote(poll_id, option_id, voter_id, ctx),
        }
    }

    fn join(&mut self, poll_id: PollId, ctx: &mut ws::WebsocketContext<Self>) {
        let joined = match self.connection.join(poll_id) {
            Ok(joined) => joined,
            Err(err) => return self.send_error(ctx, &err, Some(poll_id)),
        };
        let rooms = self.rooms.clone();
        let polls = self.polls.clone();
        let client = ctx.address();
        let fut = async move {
            if joined {
                rooms
                    .send(SpanMessage::new(Join { poll_id, client }))
                    .await
                    .map_err(|err| PollError::Transient(format!("room actor: {err}")))?;
            }
            polls.get_poll(poll_id).await
        }
        .instrument(self.span.clone());

        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| match result {
            Ok(model) => act.push(ctx, model),
            Err(err) => {
                if act.connection.leave(poll_id) {
                    act.rooms.do_send(SpanMessage::new(Leave {
                        poll_id,
                        client: ctx.address(),
                    }));
                }
                act.send_error(ctx, &err, Some(poll_id));
            }
        }));
    }

    fn vote(
        &mut self,
        poll_id: PollId,
        option_id: OptionId,
        claimed: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let voter_id = match self.connection.resolve_voter(claimed.as_deref()) {
            Ok(voter_id) => voter_id,
            Err(err) => {
                warn!(poll_id = %poll_id, "Rejected socket vote: {err}");
                return self.send_error(ctx, &err, Some(poll_id));
            }
        };
        let limiter = self.limiter.clone();
        let polls = self.polls.clone();
        let fut = async move {
            limiter.check(voter_id.as_str(), Bucket::Vote).await?;
            polls
                .admit_vote(Ballot {
                    poll_id,
                    option_id,
                    voter_id,
                })
                .await
        }
        .instrument(self.span.clone());

        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| match result {
            Ok(receipt) if receipt.written => act.push(ctx, receipt.model),
            Ok(receipt) => act.reply(ctx, receipt.model),
            Err(err) => act.send_error(ctx, &err, Some(poll_id)),
        }));
    }
}

impl Actor for WsClient {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let _enter = self.span.enter();
        info!("New ws client");
        WEBSOCKET_CONNECTIONS.inc();
        self.connection = std::mem::take(&mut self.connection).open();
        self.rooms.do_send(SpanMessage::new(Connect {
            client: ctx.address(),
        }));
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        let _enter = self.span.enter();
        let left = self.connection.disconnect();
        info!(rooms = left.len(), "Ws client left");
        WEBSOCKET_CONNECTIONS.dec();
        self.rooms.do_send(SpanMessage::new(Disconnect {
            client: ctx.address(),
        }));
    }
}

// Incoming messages from ws
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsClient {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let span = self.span.clone();
        let _enter = span.enter();
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<IncomingMessage>(&text) {
                Ok(message) => {
                    debug!(?message, "Incoming message");
                    self.handle_message(message, ctx);
                }
                Err(err) => {
                    debug!("Malformed message: {err}");
                    self.send_error(ctx, &PollError::invalid(format!("Malformed message: {err}")), None);
                }
            },
            Ok(ws::Message::Ping(bytes)) => ctx.pong(&bytes),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!("Got close message from WS. Reason: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(message) => {
                warn!("Client sent something else than text: {:?}", message);
            }
            Err(err) => {
                error!("ProtocolError in StreamHandler {:?}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<PollUpdate> for WsClient {
    type Result = ();

    fn handle(&mut self, msg: PollUpdate, ctx: &mut Self::Context) {
        if self.connection.is_member(msg.poll_id()) {
            self.push(ctx, msg.0);
        }
    }
}

impl Handler<Shutdown> for WsClient {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Away,
            description: Some("Server shutting down".to_owned()),
        }));
        ctx.stop();
    }
}
