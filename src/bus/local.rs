use super::{FanoutBus, PollUpdate};
use crate::db::poll::PollId;
use crate::error::PollResult;
use actix::prelude::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

struct Attached {
    topics: HashSet<PollId>,
    deliver: Recipient<PollUpdate>,
}

#[derive(Default)]
struct Hub {
    attached: HashMap<usize, Attached>,
    next_id: usize,
}

/// In-process broker. Used when no Redis is configured, and by tests that
/// run several instances inside one process.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<Hub>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, deliver: Recipient<PollUpdate>) -> LocalBus {
        let mut hub = self.inner.lock();
        let id = hub.next_id;
        hub.next_id += 1;
        hub.attached.insert(
            id,
            Attached {
                topics: HashSet::new(),
                deliver,
            },
        );
        LocalBus {
            hub: self.clone(),
            id,
        }
    }

    pub fn subscriber_count(&self, poll: PollId) -> usize {
        self.inner
            .lock()
            .attached
            .values()
            .filter(|attached| attached.topics.contains(&poll))
            .count()
    }
}

pub struct LocalBus {
    hub: LocalHub,
    id: usize,
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, update: &PollUpdate) -> PollResult<()> {
        let hub = self.hub.inner.lock();
        let poll = update.poll_id();
        for attached in hub.attached.values() {
            if attached.topics.contains(&poll) {
                attached.deliver.do_send(update.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, poll: PollId) -> PollResult<()> {
        if let Some(attached) = self.hub.inner.lock().attached.get_mut(&self.id) {
            attached.topics.insert(poll);
            debug!(poll_id = %poll, bus = self.id, "Subscribed to poll topic");
        }
        Ok(())
    }

    async fn unsubscribe(&self, poll: PollId) -> PollResult<()> {
        if let Some(attached) = self.hub.inner.lock().attached.get_mut(&self.id) {
            attached.topics.remove(&poll);
            debug!(poll_id = %poll, bus = self.id, "Unsubscribed from poll topic");
        }
        Ok(())
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.hub.inner.lock().attached.remove(&self.id);
    }
}
