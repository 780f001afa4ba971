use std::sync::Arc;

use tracing::{debug, trace};

use super::ReplayScheduler;
use crate::cache::DataMessageCache;
use crate::message::AckMessage;
use crate::store::StateStore;
use crate::tracking::PartitionsStates;
use crate::AppResult;

/// Clears the bookkeeping of acknowledged messages.
#[derive(Debug)]
pub struct AckProcessor<S: StateStore, R> {
    cache: Arc<DataMessageCache<S>>,
    states: Arc<PartitionsStates<S>>,
    scheduler: Arc<R>,
}

impl<S: StateStore, R: ReplayScheduler> AckProcessor<S, R> {
    pub fn new(
        cache: Arc<DataMessageCache<S>>,
        states: Arc<PartitionsStates<S>>,
        scheduler: Arc<R>,
    ) -> Self {
        Self {
            cache,
            states,
            scheduler,
        }
    }

    /// Returns false for acks of messages this process does not know (anymore).
    pub async fn on_ack(&self, ack: &AckMessage) -> AppResult<bool> {
        let Some(entry) = self.cache.remove(&ack.message_id).await? else {
            debug!("ack for unknown message {}", ack.message_id);
            return Ok(false);
        };
        self.states.untrack(entry.partition, &entry.message_id);
        if let Some(offset) = self.cache.read_from_offset(entry.partition) {
            self.states.update_read_from(entry.partition, offset);
        }
        self.scheduler
            .cancel(&entry.message_id, &entry.message.header().counterparties())
            .await?;
        trace!(
            "message {} acknowledged (partition {}, offset {})",
            entry.message_id,
            entry.partition,
            entry.offset
        );
        Ok(true)
    }

    /// Processes a batch and returns how many acks matched a tracked message.
    pub async fn on_acks(&self, acks: &[AckMessage]) -> AppResult<usize> {
        let mut matched = 0;
        for ack in acks {
            if self.on_ack(ack).await? {
                matched += 1;
            }
        }
        Ok(matched)
    }
}
