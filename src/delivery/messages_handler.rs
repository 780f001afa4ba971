use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace, warn};

use super::{OutboundPipeline, ReplayScheduler};
use crate::cache::DataMessageCache;
use crate::message::{LogRecord, OutboundMessage};
use crate::store::StateStore;
use crate::tracking::PartitionsStates;
use crate::{AppError, AppResult, ConfigHolder};

/// Ingress of records read from the log.
///
/// Tracked messages are cached and tracked before they are forwarded; the partition offsets
/// only advance once the whole batch has been handed to the outbound pipeline. A failed
/// batch leaves them where they were so the log delivers it again.
#[derive(Debug)]
pub struct MessagesHandler<S: StateStore, P, R> {
    cache: Arc<DataMessageCache<S>>,
    states: Arc<PartitionsStates<S>>,
    pipeline: Arc<P>,
    scheduler: Arc<R>,
    config: Arc<ConfigHolder>,
}

impl<S, P, R> MessagesHandler<S, P, R>
where
    S: StateStore,
    P: OutboundPipeline,
    R: ReplayScheduler,
{
    pub fn new(
        cache: Arc<DataMessageCache<S>>,
        states: Arc<PartitionsStates<S>>,
        pipeline: Arc<P>,
        scheduler: Arc<R>,
        config: Arc<ConfigHolder>,
    ) -> Self {
        Self {
            cache,
            states,
            pipeline,
            scheduler,
            config,
        }
    }

    /// Caches and tracks `records`, returning the ones to forward.
    pub async fn on_next(&self, records: &[LogRecord]) -> Vec<LogRecord> {
        let entries = records.iter().filter_map(LogRecord::to_cache_entry).collect();
        for partition in self.cache.put(entries).await {
            if let Some(offset) = self.cache.read_from_offset(partition) {
                self.states.update_read_from(partition, offset);
            }
        }
        let forward = self.states.record_read(Utc::now(), records);
        trace!("{} of {} records to forward", forward.len(), records.len());
        forward
    }

    pub fn on_batch_handled(&self, records: &[LogRecord]) {
        self.states.record_sent(records);
    }

    /// Runs one batch end to end and returns the number of forwarded messages.
    pub async fn process_batch(&self, records: Vec<LogRecord>) -> AppResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let forward = self.on_next(&records).await;
        let messages: Vec<OutboundMessage> =
            forward.iter().filter_map(|r| r.value.clone()).collect();
        let count = messages.len();
        let snapshot = self.config.current();

        // scheduled before the send so an early ack always finds something to cancel
        let tracked: Vec<&OutboundMessage> = messages.iter().filter(|m| m.is_tracked()).collect();
        for (scheduled, message) in tracked.iter().enumerate() {
            if let Err(e) = self
                .scheduler
                .schedule(
                    message.message_id(),
                    &message.header().counterparties(),
                    snapshot.replay_period,
                )
                .await
            {
                warn!("replay of {} not scheduled: {}", message.message_id(), e);
                self.abandon(&forward, &tracked[..scheduled]).await;
                return Err(e);
            }
        }

        let sent = tokio::time::timeout(
            snapshot.outbound_batch_timeout,
            self.pipeline.forward(messages.clone()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(AppError::Timeout(format!(
                "forwarding {} messages took longer than {:?}",
                count, snapshot.outbound_batch_timeout
            )))
        });

        if let Err(e) = sent {
            warn!("batch of {} records not delivered: {}", records.len(), e);
            self.abandon(&forward, &tracked).await;
            return Err(e);
        }

        self.on_batch_handled(&records);
        debug!("forwarded {} messages", count);
        Ok(count)
    }

    /// Leaves a failed batch for redelivery: its records are forwarded again when the log
    /// re-reads them and the replays already scheduled for it are withdrawn.
    async fn abandon(&self, forward: &[LogRecord], scheduled: &[&OutboundMessage]) {
        self.states.mark_for_redrive(forward);
        for message in scheduled {
            if let Err(e) = self
                .scheduler
                .cancel(message.message_id(), &message.header().counterparties())
                .await
            {
                warn!("replay of {} not cancelled: {}", message.message_id(), e);
            }
        }
    }
}
