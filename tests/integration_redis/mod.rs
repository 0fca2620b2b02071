use actix::prelude::*;
use dotenv::dotenv;
use livepoll_server::bus::PollUpdate;
use livepoll_server::kv;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, Client};
use std::sync::Arc;

/// Connection to `REDIS_URL`, or `None` so callers can skip.
pub async fn connect() -> Option<(Client, ConnectionManager)> {
    dotenv().ok();
    let url = std::env::var("REDIS_URL").ok()?;
    Some(kv::connect(&url).await.unwrap())
}

/// Unique key prefix so parallel tests never share state.
pub fn namespace() -> String {
    format!("test:{}", uuid::Uuid::new_v4().simple())
}

/// Records every poll update delivered to it.
#[derive(Clone, Default)]
pub struct Collector {
    pub received: Arc<Mutex<Vec<PollUpdate>>>,
}

impl Actor for Collector {
    type Context = Context<Self>;
}

impl Handler<PollUpdate> for Collector {
    type Result = ();

    fn handle(&mut self, msg: PollUpdate, _ctx: &mut Context<Self>) {
        self.received.lock().push(msg);
    }
}
