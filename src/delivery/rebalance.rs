use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info};

use super::ReplayScheduler;
use crate::cache::DataMessageCache;
use crate::store::StateStore;
use crate::tracking::PartitionsStates;
use crate::{AppResult, ConfigHolder};

/// Consumer-group callbacks of the log.
pub trait PartitionAssignmentListener: Send + Sync {
    fn on_assigned(&self, partitions: &[i32]) -> impl Future<Output = AppResult<()>> + Send;

    fn on_unassigned(&self, partitions: &[i32]) -> impl Future<Output = AppResult<()>> + Send;
}

/// Where the log resumes reading a newly assigned partition.
pub trait StartingOffsetProvider: Send + Sync {
    fn starting_offset(&self, partition: i32) -> i64;
}

impl<S: StateStore> StartingOffsetProvider for PartitionsStates<S> {
    fn starting_offset(&self, partition: i32) -> i64 {
        PartitionsStates::starting_offset(self, partition)
    }
}

/// Loads tracking state on assignment and drops it, with cached messages, on revocation.
///
/// Restored messages below the starting offset are never read again, so their replays are
/// scheduled right after the load. Restored messages without a spilled copy are untracked:
/// either their ack already deleted the copy, or they sit at or above the starting offset
/// and are tracked again when the log redelivers them.
#[derive(Debug)]
pub struct TrackingAssignmentListener<S: StateStore, R> {
    states: Arc<PartitionsStates<S>>,
    cache: Arc<DataMessageCache<S>>,
    scheduler: Arc<R>,
    config: Arc<ConfigHolder>,
}

impl<S: StateStore, R: ReplayScheduler> TrackingAssignmentListener<S, R> {
    pub fn new(
        states: Arc<PartitionsStates<S>>,
        cache: Arc<DataMessageCache<S>>,
        scheduler: Arc<R>,
        config: Arc<ConfigHolder>,
    ) -> Self {
        Self {
            states,
            cache,
            scheduler,
            config,
        }
    }

    async fn reschedule_restored(&self, partition: i32) -> AppResult<usize> {
        let restored: Vec<String> = self
            .states
            .with_state(partition, |state| {
                state
                    .tracked()
                    .values()
                    .filter(|entry| entry.needs_redrive())
                    .map(|entry| entry.message_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        if restored.is_empty() {
            return Ok(0);
        }

        let starting_offset = self.states.starting_offset(partition);
        let period = self.config.current().replay_period;
        let mut scheduled = 0;
        for message_id in restored {
            match self.cache.get(&message_id).await? {
                Some(entry) if entry.offset < starting_offset => {
                    self.scheduler
                        .schedule(&message_id, &entry.message.header().counterparties(), period)
                        .await?;
                    scheduled += 1;
                }
                Some(_) => {}
                // acked after its durable copy was deleted, or never spilled and read again
                None => {
                    debug!("restored message {} is not cached, untracked", message_id);
                    self.states.untrack(partition, &message_id);
                }
            }
        }
        Ok(scheduled)
    }
}

impl<S: StateStore, R: ReplayScheduler> PartitionAssignmentListener
    for TrackingAssignmentListener<S, R>
{
    async fn on_assigned(&self, partitions: &[i32]) -> AppResult<()> {
        info!("partitions assigned: {:?}", partitions);
        self.states.load_partitions(partitions).await?;
        for partition in partitions {
            let scheduled = self.reschedule_restored(*partition).await?;
            if scheduled > 0 {
                info!(
                    "partition {}: {} spilled messages scheduled for replay",
                    partition, scheduled
                );
            }
        }
        Ok(())
    }

    async fn on_unassigned(&self, partitions: &[i32]) -> AppResult<()> {
        info!("partitions revoked: {:?}", partitions);
        self.states.forget_partitions(partitions);
        self.cache.forget_partitions(partitions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use dashmap::DashSet;

    use super::*;
    use crate::message::{CounterpartyKey, LogRecord, MessageHeader, OutboundMessage};
    use crate::cache::spill_key;
    use crate::store::{MemoryStateStore, VersionedRecord};
    use crate::{DeliverySettings, HealthRegistry, StateStore};

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: DashSet<String>,
    }

    impl ReplayScheduler for RecordingScheduler {
        async fn schedule(&self, message_id: &str, _: &CounterpartyKey, _: Duration) -> AppResult<()> {
            self.scheduled.insert(message_id.to_string());
            Ok(())
        }

        async fn cancel(&self, message_id: &str, _: &CounterpartyKey) -> AppResult<()> {
            self.scheduled.remove(message_id);
            Ok(())
        }
    }

    type Parts = (
        Arc<PartitionsStates<MemoryStateStore>>,
        Arc<DataMessageCache<MemoryStateStore>>,
        TrackingAssignmentListener<MemoryStateStore, RecordingScheduler>,
        Arc<RecordingScheduler>,
    );

    fn parts(store: Arc<MemoryStateStore>) -> Parts {
        let config = Arc::new(
            ConfigHolder::from_settings(&DeliverySettings {
                max_cache_offset_age: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let registry = HealthRegistry::new();
        let states = Arc::new(PartitionsStates::new(
            store.clone(),
            config.clone(),
            registry.register("partitions_states", &[]),
        ));
        let cache = Arc::new(DataMessageCache::new(
            store,
            config.clone(),
            registry.register("message_cache", &[]),
        ));
        let scheduler = Arc::new(RecordingScheduler::default());
        let listener = TrackingAssignmentListener::new(
            states.clone(),
            cache.clone(),
            scheduler.clone(),
            config,
        );
        (states, cache, listener, scheduler)
    }

    fn record(offset: i64) -> LogRecord {
        let id = format!("m{}", offset);
        LogRecord::new(
            id.clone(),
            Some(OutboundMessage::Authenticated {
                header: MessageHeader::new(id, "alice", "bob"),
                payload: Bytes::from_static(b"x"),
            }),
            0,
            offset,
        )
    }

    #[tokio::test]
    async fn assignment_round_trip() {
        let (states, _, listener, _) = parts(Arc::new(MemoryStateStore::new()));

        listener.on_assigned(&[0, 1]).await.unwrap();
        assert_eq!(states.loaded_partitions(), vec![0, 1]);
        let provider: &dyn StartingOffsetProvider = &*states;
        assert_eq!(provider.starting_offset(1), 0);

        listener.on_unassigned(&[1]).await.unwrap();
        assert_eq!(states.loaded_partitions(), vec![0]);
    }

    #[tokio::test]
    async fn spilled_messages_below_the_start_are_replayed_after_reassignment() {
        let store = Arc::new(MemoryStateStore::new());
        {
            let (states, cache, listener, _) = parts(store.clone());
            listener.on_assigned(&[0]).await.unwrap();
            let records: Vec<LogRecord> = (10..=12).map(record).collect();
            let entries = records.iter().filter_map(LogRecord::to_cache_entry).collect();
            for partition in cache.put(entries).await {
                states.update_read_from(partition, cache.read_from_offset(partition).unwrap());
            }
            states.record_read(Utc::now(), &records);
            states.record_sent(&records);
            states.persist_once().await;
        }

        let (states, _, listener, scheduler) = parts(store);
        listener.on_assigned(&[0]).await.unwrap();
        // m10 spilled below the watermark, m11 and m12 are read again from offset 11
        assert_eq!(states.starting_offset(0), 11);
        assert!(scheduler.scheduled.contains("m10"));
        assert!(!scheduler.scheduled.contains("m11"));
        assert!(!scheduler.scheduled.contains("m12"));
        assert_eq!(states.with_state(0, |s| s.tracked().len()), Some(1));
    }

    #[tokio::test]
    async fn restored_messages_without_a_copy_are_untracked() {
        let store = Arc::new(MemoryStateStore::new());
        let records: Vec<LogRecord> = (10..=12).map(record).collect();
        {
            let (states, cache, listener, _) = parts(store.clone());
            listener.on_assigned(&[0]).await.unwrap();
            let entries = records.iter().filter_map(LogRecord::to_cache_entry).collect();
            for partition in cache.put(entries).await {
                states.update_read_from(partition, cache.read_from_offset(partition).unwrap());
            }
            states.record_read(Utc::now(), &records);
            states.record_sent(&records);
            states.persist_once().await;
        }
        // the ack deleted the spilled copy of m10, the process died before untracking it
        let failures = store
            .delete(vec![VersionedRecord::new(spill_key("m10"), Bytes::new(), 0)])
            .await
            .unwrap();
        assert!(failures.is_empty());

        let (states, _, listener, scheduler) = parts(store);
        listener.on_assigned(&[0]).await.unwrap();
        assert!(scheduler.scheduled.is_empty());
        assert_eq!(states.with_state(0, |s| s.tracked().len()), Some(0));

        // redelivered messages are tracked and forwarded again
        let forwarded = states.record_read(Utc::now(), &records[1..]);
        assert_eq!(forwarded.len(), 2);
        assert!(states.with_state(0, |s| s.is_tracked("m11")).unwrap());
    }
}
