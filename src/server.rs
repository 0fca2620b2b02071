use crate::db::poll::{NewPoll, OptionId, PollId, VoterId};
use crate::db::vote::Ballot;
use crate::error::{PollError, PollResult};
use crate::metrics;
use crate::ratelimit::Bucket;
use crate::services::connection::ConnectionState;
use crate::services::AppState;
use crate::websocket::WsClient;
use actix_web::{dev::Payload, http::header::ContentType, web, Error, FromRequest, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Caller of an `/api` route, admitted by the api rate limit bucket.
pub struct Caller(pub Option<VoterId>);

impl Caller {
    pub fn require(self) -> PollResult<VoterId> {
        self.0
            .ok_or_else(|| PollError::Unauthenticated("Authentication required".to_owned()))
    }
}

impl FromRequest for Caller {
    type Error = PollError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AppState>>().cloned();
        // Socket address only. Forwarding headers are client supplied.
        let peer = req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        let voter = state.as_ref().map(|state| state.verifier.identify(req));
        Box::pin(async move {
            let state =
                state.ok_or_else(|| PollError::Fatal("application state missing".to_owned()))?;
            let voter = voter.transpose()?.flatten();
            let key = match &voter {
                Some(voter) => format!("user:{voter}"),
                None => format!("ip:{peer}"),
            };
            state.limiter.check(&key, Bucket::Api).await?;
            Ok(Caller(voter))
        })
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct CreatePollRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct VoteRequest {
    pub option_id: OptionId,
}

#[derive(Deserialize, Debug)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    pub status: String,
    pub store: String,
}

async fn create_poll(
    caller: Caller,
    state: web::Data<AppState>,
    body: web::Json<CreatePollRequest>,
) -> PollResult<HttpResponse> {
    let created_by = caller.require()?;
    let body = body.into_inner();
    let model = state
        .polls
        .create_poll(NewPoll {
            title: body.title,
            description: body.description,
            options: body.options,
            created_by,
            expires_at: body.expires_at,
        })
        .await?;
    Ok(HttpResponse::Created().json(model))
}

async fn get_poll(
    _caller: Caller,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> PollResult<HttpResponse> {
    let id: PollId = path.parse()?;
    Ok(HttpResponse::Ok().json(state.polls.get_poll(id).await?))
}

async fn list_polls(
    _caller: Caller,
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> PollResult<HttpResponse> {
    let polls = state.polls.list_polls(query.limit, query.offset).await?;
    Ok(HttpResponse::Ok().json(polls))
}

async fn vote(
    caller: Caller,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<VoteRequest>,
) -> PollResult<HttpResponse> {
    let voter_id = caller.require()?;
    let poll_id: PollId = path.parse()?;
    state.limiter.check(voter_id.as_str(), Bucket::Vote).await?;
    let model = state
        .polls
        .cast_vote(Ballot {
            poll_id,
            option_id: body.option_id,
            voter_id,
        })
        .await?;
    Ok(HttpResponse::Ok().json(model))
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    match state.health().await {
        Ok(()) => HttpResponse::Ok().json(Health {
            status: "ok".to_owned(),
            store: "ok".to_owned(),
        }),
        Err(err) => {
            warn!("Health check failed: {err}");
            HttpResponse::ServiceUnavailable().json(Health {
                status: "degraded".to_owned(),
                store: err.to_string(),
            })
        }
    }
}

async fn metrics_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(metrics::render())
}

async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let voter = state.verifier.authenticate(&req)?;
    debug!(voter = %voter, "Websocket handshake authenticated");
    let connection = ConnectionState::Connecting.authenticate(voter)?;
    ws::start(
        WsClient::new(
            connection,
            state.polls.clone(),
            state.limiter.clone(),
            state.rooms.clone(),
        ),
        &req,
        stream,
    )
}

/// JSON body errors use the same `{error, message}` shape as every other
/// failure.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        PollError::invalid(format!("Invalid request body: {err}")).into()
    })
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        PollError::invalid(format!("Invalid query: {err}")).into()
    })
}

pub fn configure(cfg: &mut web::ServiceConfig, state: AppState) {
    cfg.app_data(web::Data::new(state))
        .app_data(json_config())
        .app_data(query_config())
        .service(
            web::scope("/api")
                .route("/polls", web::post().to(create_poll))
                .route("/polls", web::get().to(list_polls))
                .route("/polls/{id}", web::get().to(get_poll))
                .route("/polls/{id}/vote", web::post().to(vote)),
        )
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_route))
        .service(web::resource("/ws/").to(ws_route));
}
