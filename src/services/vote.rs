use super::PollService;
use crate::bus::PollUpdate;
use crate::db::poll::ReadModel;
use crate::db::vote::{Ballot, VoteOutcome};
use crate::error::{bounded, PollError, PollResult};
use crate::metrics::VOTES_CAST;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

/// Result of admitting a ballot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteReceipt {
    /// The poll as it stands after the ballot.
    pub model: ReadModel,
    /// False when the ballot repeated the voter's current choice.
    pub written: bool,
}

impl PollService {
    /// Admits one ballot and returns the poll as it stands after it.
    pub async fn cast_vote(&self, ballot: Ballot) -> PollResult<ReadModel> {
        self.admit_vote(ballot).await.map(|receipt| receipt.model)
    }

    /// Checks and the write commit together in the store. Afterwards the
    /// cached read model is dropped and a fresh one is pushed to every
    /// instance watching the poll.
    ///
    /// An error after the commit leaves the vote in place. Sending the same
    /// ballot again is safe: it comes back unchanged with the current poll.
    #[instrument(
        skip(self, ballot),
        fields(poll_id = %ballot.poll_id, voter = %ballot.voter_id)
    )]
    pub async fn admit_vote(&self, ballot: Ballot) -> PollResult<VoteReceipt> {
        let now = Utc::now();
        let poll_id = ballot.poll_id;
        let outcome = bounded(
            self.timeout,
            "record vote",
            self.store.record_vote(&ballot, now),
        )
        .await?;

        match outcome {
            VoteOutcome::Expired => {
                info!("Poll expired before the vote landed, closed it");
                self.cache.invalidate(poll_id).await;
                Err(PollError::PollClosed)
            }
            VoteOutcome::Unchanged => {
                debug!("Repeat of the current vote, nothing written");
                Ok(VoteReceipt {
                    model: self.get_poll(poll_id).await?,
                    written: false,
                })
            }
            VoteOutcome::Recorded { revision } | VoteOutcome::Changed { revision, .. } => {
                VOTES_CAST.inc();
                debug!(revision, ?outcome, "Vote committed");
                self.cache.invalidate_at(poll_id, revision).await;
                let model = match self.load_fresh(poll_id, now).await {
                    Ok(model) => model,
                    Err(err) => {
                        warn!(revision, "Reload after vote failed, retrying once: {err}");
                        self.load_fresh(poll_id, now).await?
                    }
                };
                self.publish(PollUpdate(model.clone())).await;
                Ok(VoteReceipt {
                    model,
                    written: true,
                })
            }
        }
    }

    /// Publishes on the bus, or straight to this instance's rooms when the
    /// bus is unavailable.
    async fn publish(&self, update: PollUpdate) {
        if let Err(err) = bounded(self.timeout, "bus publish", self.bus.publish(&update)).await {
            warn!(
                poll_id = %update.poll_id(),
                "Publish failed, updating local viewers only: {err}"
            );
            self.rooms.do_send(update);
        }
    }
}
