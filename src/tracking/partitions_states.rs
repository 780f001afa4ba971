// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Owner of every loaded [`PartitionTrackingState`].
//!
//! # Persistence cycle
//!
//! A single background task snapshots all dirty states and writes them as one batch:
//! never-stored states through `create`, the others through `update` with their expected
//! version. Per partition:
//! - a confirmed write calls `mark_saved`, so `stored_version` follows the store
//! - a version conflict means another process owns the partition; the component fails
//!   immediately and the task stops
//! - an I/O failure counts towards `max_persistence_retries`; reaching it fails the
//!   component as well
//!
//! A failed component stays failed until an operator resets it, ingress keeps working
//! but nothing is saved anymore and the health registry says so.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::partition_state::{state_key, PartitionTrackingState, StateSnapshot};
use crate::message::LogRecord;
use crate::store::{KeyFailure, StateStore, VersionedRecord};
use crate::{AppError, AppResult, ConfigHolder, HealthHandle, LifecycleState, Shutdown};

/// Result of one persistence cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceOutcome {
    /// Nothing was dirty.
    Idle,
    /// Every dirty partition was written.
    Saved(usize),
    /// Technical failure, the next cycle retries. Carries the consecutive failure count.
    Retrying(u32),
    /// The component is failed, the task must stop.
    Failed,
}

#[derive(Debug, Default)]
struct GroupResult {
    conflicts: Vec<String>,
    technical_failure: bool,
}

#[derive(Debug)]
pub struct PartitionsStates<S: StateStore> {
    states: DashMap<i32, PartitionTrackingState>,
    store: Arc<S>,
    config: Arc<ConfigHolder>,
    health: HealthHandle,
    consecutive_failures: AtomicU32,
}

impl<S: StateStore> PartitionsStates<S> {
    pub fn new(store: Arc<S>, config: Arc<ConfigHolder>, health: HealthHandle) -> Self {
        Self {
            states: DashMap::new(),
            store,
            config,
            health,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn health(&self) -> &HealthHandle {
        &self.health
    }

    /// Materializes the state of every partition in `partitions` that is not loaded yet.
    ///
    /// Partitions without a stored state start from the zero state. A stored state that
    /// cannot be decoded fails the load of that partition and the component.
    pub async fn load_partitions(&self, partitions: &[i32]) -> AppResult<()> {
        let to_load: Vec<i32> = partitions
            .iter()
            .copied()
            .filter(|p| !self.states.contains_key(p))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if to_load.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = to_load.iter().map(|p| state_key(*p)).collect();
        let stored: HashMap<String, VersionedRecord> = self
            .store
            .get(keys)
            .await
            .inspect_err(|e| self.report_fault(e))?
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();

        let mut first_error = None;
        for partition in to_load {
            let state = match stored.get(&state_key(partition)) {
                Some(record) => {
                    match PartitionTrackingState::deserialize(
                        partition,
                        &record.value,
                        record.version,
                    ) {
                        Ok(state) => state,
                        Err(e) => {
                            error!("cannot load state of partition {}: {}", partition, e);
                            first_error.get_or_insert(e);
                            continue;
                        }
                    }
                }
                None => PartitionTrackingState::new(partition),
            };
            info!(
                "partition {} loaded, restart offset {}, {} tracked messages",
                partition,
                state.restart_offset(),
                state.tracked().len()
            );
            self.states.entry(partition).or_insert(state);
        }

        match first_error {
            Some(e) => {
                self.report_fault(&e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Unrecoverable faults fail the component; anything else only takes it down until the
    /// next successful store call.
    fn report_fault(&self, fault: &AppError) {
        if fault.is_unrecoverable() {
            self.health.report_error();
        } else {
            self.health.report(LifecycleState::Down);
        }
    }

    /// Drops the in-memory state of revoked partitions without writing it back.
    pub fn forget_partitions(&self, partitions: &[i32]) {
        for partition in partitions {
            if self.states.remove(partition).is_some() {
                info!("partition {} forgotten", partition);
            }
        }
    }

    pub fn is_loaded(&self, partition: i32) -> bool {
        self.states.contains_key(&partition)
    }

    pub fn loaded_partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.states.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    /// Offset the log resumes from; 0 for a partition that is not loaded.
    pub fn starting_offset(&self, partition: i32) -> i64 {
        self.states
            .get(&partition)
            .map(|state| state.starting_offset())
            .unwrap_or(0)
    }

    /// Read-only access to one partition state.
    pub fn with_state<R>(
        &self,
        partition: i32,
        f: impl FnOnce(&PartitionTrackingState) -> R,
    ) -> Option<R> {
        self.states.get(&partition).map(|state| f(state.value()))
    }

    fn by_partition(records: &[LogRecord]) -> BTreeMap<i32, Vec<&LogRecord>> {
        let mut grouped: BTreeMap<i32, Vec<&LogRecord>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.partition).or_default().push(record);
        }
        grouped
    }

    /// Tracks `records` and returns, in input order, the ones to forward downstream.
    pub fn record_read(&self, now: DateTime<Utc>, records: &[LogRecord]) -> Vec<LogRecord> {
        let mut forward: HashSet<(i32, i64)> = HashSet::with_capacity(records.len());
        for (partition, group) in Self::by_partition(records) {
            match self.states.get_mut(&partition) {
                Some(mut state) => {
                    for record in state.record_read(now, group) {
                        forward.insert((record.partition, record.offset));
                    }
                }
                None => {
                    warn!(
                        "partition {} is not assigned here, forwarding {} records untracked",
                        partition,
                        group.len()
                    );
                    forward.extend(group.iter().map(|r| (r.partition, r.offset)));
                }
            }
        }
        records
            .iter()
            .filter(|r| forward.contains(&(r.partition, r.offset)))
            .cloned()
            .collect()
    }

    pub fn record_sent(&self, records: &[LogRecord]) {
        for (partition, group) in Self::by_partition(records) {
            if let Some(mut state) = self.states.get_mut(&partition) {
                state.record_sent(group);
            }
        }
    }

    pub fn mark_for_redrive(&self, records: &[LogRecord]) {
        for (partition, group) in Self::by_partition(records) {
            if let Some(mut state) = self.states.get_mut(&partition) {
                state.mark_for_redrive(group);
            }
        }
    }

    pub fn untrack(&self, partition: i32, message_id: &str) -> bool {
        self.states
            .get_mut(&partition)
            .map(|mut state| state.untrack(message_id))
            .unwrap_or(false)
    }

    pub fn update_read_from(&self, partition: i32, offset: i64) {
        if let Some(mut state) = self.states.get_mut(&partition) {
            state.update_read_from(offset);
        }
    }

    /// One persistence cycle. See the module documentation for the failure rules.
    pub async fn persist_once(&self) -> PersistenceOutcome {
        if self.health.is_failed() {
            return PersistenceOutcome::Failed;
        }

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for entry in self.states.iter() {
            if !entry.is_dirty() {
                continue;
            }
            match entry.snapshot() {
                Ok(snapshot) if snapshot.version.is_none() => creates.push(snapshot),
                Ok(snapshot) => updates.push(snapshot),
                Err(e) => error!("cannot serialize partition {}: {}", entry.key(), e),
            }
        }
        if creates.is_empty() && updates.is_empty() {
            self.health.report_up();
            return PersistenceOutcome::Idle;
        }

        let written = creates.len() + updates.len();
        trace!(
            "persisting {} new and {} existing partition states",
            creates.len(),
            updates.len()
        );

        let created = if creates.is_empty() {
            GroupResult::default()
        } else {
            let records = Self::to_records(&creates);
            let result = self.store.create(records).await;
            self.apply_group_result(&creates, result)
        };
        let updated = if updates.is_empty() {
            GroupResult::default()
        } else {
            let records = Self::to_records(&updates);
            let result = self.store.update(records).await;
            self.apply_group_result(&updates, result)
        };

        let conflicts: Vec<String> = created
            .conflicts
            .into_iter()
            .chain(updated.conflicts)
            .collect();
        if !conflicts.is_empty() {
            let fault = AppError::VersionConflict(conflicts.join(","));
            error!(
                "partition state owned by another writer, persistence stopped: {}",
                fault
            );
            self.report_fault(&fault);
            return PersistenceOutcome::Failed;
        }

        if created.technical_failure || updated.technical_failure {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            let max_retries = self.config.current().max_persistence_retries;
            if failures >= max_retries {
                error!(
                    "persisting partition states failed {} times in a row, giving up",
                    failures
                );
                // a reset starts counting from scratch
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.health.report_error();
                return PersistenceOutcome::Failed;
            }
            warn!(
                "persisting partition states failed ({}/{}), will retry",
                failures, max_retries
            );
            self.health.report(LifecycleState::Down);
            return PersistenceOutcome::Retrying(failures);
        }

        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.health.report_up();
        debug!("persisted {} partition states", written);
        PersistenceOutcome::Saved(written)
    }

    fn to_records(snapshots: &[StateSnapshot]) -> Vec<VersionedRecord> {
        snapshots
            .iter()
            .map(|s| {
                VersionedRecord::new(state_key(s.partition), s.value.clone(), s.version.unwrap_or(0))
            })
            .collect()
    }

    fn apply_group_result(
        &self,
        snapshots: &[StateSnapshot],
        result: AppResult<Vec<KeyFailure>>,
    ) -> GroupResult {
        let failures = match result {
            Ok(failures) => failures,
            Err(e) => {
                warn!("state store call failed: {}", e);
                return GroupResult {
                    conflicts: Vec::new(),
                    technical_failure: true,
                };
            }
        };

        let mut group = GroupResult::default();
        let failed: HashSet<&str> = failures.iter().map(|f| f.key.as_str()).collect();
        for failure in &failures {
            if failure.is_conflict() {
                group.conflicts.push(failure.key.clone());
            } else {
                warn!("writing {} failed: {:?}", failure.key, failure.failure);
                group.technical_failure = true;
            }
        }

        for snapshot in snapshots {
            if failed.contains(state_key(snapshot.partition).as_str()) {
                continue;
            }
            // a partition forgotten (or forgotten and reloaded) meanwhile is left alone
            if let Some(mut state) = self.states.get_mut(&snapshot.partition) {
                if state.stored_version() == snapshot.version {
                    state.mark_saved(snapshot);
                }
            }
        }
        group
    }

    /// Spawns the periodic persistence task.
    pub fn start_persistence_task(self: &Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let states = Arc::clone(self);
        tokio::spawn(async move {
            states.run_persistence_task(shutdown).await;
        })
    }

    fn interval(period: Duration) -> Interval {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Runs persistence cycles until shutdown.
    ///
    /// The task owns its interval; a configuration change swaps it for one with the new
    /// period. A cycle in progress is never interrupted, and a last cycle runs on shutdown.
    /// After a failure the ticks are no-ops until the health of the component is reset.
    pub async fn run_persistence_task(&self, mut shutdown: Shutdown) {
        let mut config_rx = self.config.subscribe();
        let mut config_open = true;
        let mut period = config_rx.borrow_and_update().persistence_period;
        let mut interval = Self::interval(period);
        let mut suspended = false;
        info!("partition state persistence every {:?}", period);
        self.health.report_up();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let new_period = config_rx.borrow_and_update().persistence_period;
                    if new_period != period {
                        info!("persistence period changed from {:?} to {:?}", period, new_period);
                        period = new_period;
                        interval = Self::interval(period);
                    }
                    continue;
                }
                _ = shutdown.recv() => {
                    debug!("persistence task receiving shutdown signal");
                }
            }

            let failed = self.persist_once().await == PersistenceOutcome::Failed;
            if failed && !suspended {
                error!("partition state persistence suspended until its health is reset");
            } else if !failed && suspended {
                info!("partition state persistence resumed");
            }
            suspended = failed;
            if shutdown.is_shutdown() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::{fixture, rstest};
    use tokio::sync::broadcast;

    use super::*;
    use crate::message::{MessageHeader, OutboundMessage};
    use crate::store::MemoryStateStore;
    use crate::{setup_local_tracing, DeliverySettings, HealthRegistry};

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    struct Harness {
        states: Arc<PartitionsStates<MemoryStateStore>>,
        store: Arc<MemoryStateStore>,
        config: Arc<ConfigHolder>,
        registry: Arc<HealthRegistry>,
    }

    fn harness(settings: DeliverySettings) -> Harness {
        let store = Arc::new(MemoryStateStore::new());
        let config = Arc::new(ConfigHolder::from_settings(&settings).unwrap());
        let registry = HealthRegistry::new();
        let health = registry.register("partitions_states", &[]);
        let states = Arc::new(PartitionsStates::new(
            store.clone(),
            config.clone(),
            health,
        ));
        Harness {
            states,
            store,
            config,
            registry,
        }
    }

    fn record(partition: i32, offset: i64, id: &str) -> LogRecord {
        LogRecord::new(
            id,
            Some(OutboundMessage::Authenticated {
                header: MessageHeader::new(id, "alice", "bob"),
                payload: Bytes::from_static(b"p"),
            }),
            partition,
            offset,
        )
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_partitions_start_from_zero(_setup: ()) {
        let h = harness(DeliverySettings::default());
        h.states.load_partitions(&[0, 1, 1]).await.unwrap();
        assert_eq!(h.states.loaded_partitions(), vec![0, 1]);
        assert_eq!(h.states.starting_offset(0), 0);
        assert_eq!(h.states.starting_offset(42), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn persist_then_reload_after_forget(_setup: ()) {
        let h = harness(DeliverySettings::default());
        h.states.load_partitions(&[3]).await.unwrap();
        let records = vec![record(3, 20, "a"), record(3, 21, "b")];
        assert_eq!(h.states.record_read(Utc::now(), &records).len(), 2);
        h.states.record_sent(&records);

        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Saved(1));
        assert_eq!(h.store.version_of(&state_key(3)), Some(0));
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Idle);

        h.states.untrack(3, "a");
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Saved(1));
        assert_eq!(h.store.version_of(&state_key(3)), Some(1));

        h.states.forget_partitions(&[3]);
        assert!(!h.states.is_loaded(3));
        h.states.load_partitions(&[3]).await.unwrap();
        assert_eq!(h.states.starting_offset(3), 21);
        let (version, tracked) = h
            .states
            .with_state(3, |s| (s.stored_version(), s.tracked().len()))
            .unwrap();
        assert_eq!(version, Some(1));
        assert_eq!(tracked, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn malformed_stored_state_fails_the_load(_setup: ()) {
        let h = harness(DeliverySettings::default());
        h.store
            .create(vec![VersionedRecord::new(state_key(5), "{\"oops\":1}", 0)])
            .await
            .unwrap();

        let result = h.states.load_partitions(&[4, 5]).await;
        assert!(matches!(
            result,
            Err(AppError::MalformedState { partition: 5, .. })
        ));
        assert!(h.states.is_loaded(4));
        assert!(!h.states.is_loaded(5));
        assert_eq!(
            h.registry.own_state("partitions_states"),
            Some(LifecycleState::Error)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn conflicting_partitions_keep_their_version(_setup: ()) {
        let h = harness(DeliverySettings::default());
        let partitions = [0, 1, 2, 3, 4];
        h.states.load_partitions(&partitions).await.unwrap();
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Saved(5));

        for p in partitions {
            h.states.update_read_from(p, 10);
        }
        h.store.inject_conflict(state_key(1));
        h.store.inject_conflict(state_key(3));

        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Failed);
        for p in [0, 2, 4] {
            assert_eq!(h.states.with_state(p, |s| s.stored_version()), Some(Some(1)));
            assert_eq!(h.store.version_of(&state_key(p)), Some(1));
        }
        for p in [1, 3] {
            assert_eq!(h.states.with_state(p, |s| s.stored_version()), Some(Some(0)));
            assert!(h.states.with_state(p, |s| s.is_dirty()).unwrap());
        }
        assert!(h.states.health().is_failed());
    }

    #[rstest]
    #[tokio::test]
    async fn io_failures_escalate_after_max_retries(_setup: ()) {
        let h = harness(DeliverySettings {
            max_number_of_persistence_retries: 3,
            ..Default::default()
        });
        h.states.load_partitions(&[0]).await.unwrap();

        h.store.fail_next_calls(2);
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Retrying(1));
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Retrying(2));
        // a success resets the counter
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Saved(1));

        h.states.update_read_from(0, 1);
        h.store.inject_io_failure(state_key(0));
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Retrying(1));
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Retrying(2));
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Failed);
        assert_eq!(h.states.with_state(0, |s| s.stored_version()), Some(Some(0)));

        // failed is terminal, even once the store recovers
        h.store.clear_injected_failures();
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Failed);

        // until an operator resets the component, with a fresh retry budget
        h.registry.reset("partitions_states");
        h.store.fail_next_calls(1);
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Retrying(1));
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Saved(1));
        assert_eq!(h.store.version_of(&state_key(0)), Some(1));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn persistence_task_resumes_after_health_reset(_setup: ()) {
        let h = harness(DeliverySettings {
            state_persistence_period_seconds: 1.0,
            max_number_of_persistence_retries: 1,
            ..Default::default()
        });
        h.states.load_partitions(&[0]).await.unwrap();
        h.store.inject_io_failure(state_key(0));
        let (notify, _) = broadcast::channel(1);
        let task = h
            .states
            .start_persistence_task(Shutdown::new(notify.subscribe()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(h.states.health().is_failed());
        h.store.clear_injected_failures();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!h.store.contains_key(&state_key(0)));
        assert!(!task.is_finished());

        h.registry.reset("partitions_states");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.version_of(&state_key(0)), Some(0));
        assert_eq!(h.states.health().state(), LifecycleState::Up);

        notify.send(()).unwrap();
        task.await.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn clean_states_are_not_rewritten(_setup: ()) {
        let h = harness(DeliverySettings::default());
        h.states.load_partitions(&[0, 1]).await.unwrap();
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Saved(2));
        let writes = h.store.write_calls();

        h.states.update_read_from(1, 4);
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Saved(1));
        assert_eq!(h.store.write_calls(), writes + 1);
        assert_eq!(h.states.persist_once().await, PersistenceOutcome::Idle);
        assert_eq!(h.store.write_calls(), writes + 1);
        assert_eq!(h.store.version_of(&state_key(0)), Some(0));
    }

    #[rstest]
    #[tokio::test]
    async fn unreachable_store_takes_the_load_down(_setup: ()) {
        let h = harness(DeliverySettings::default());
        h.store.fail_next_calls(1);
        assert!(matches!(
            h.states.load_partitions(&[0]).await,
            Err(AppError::StoreUnavailable(_))
        ));
        assert!(!h.states.is_loaded(0));
        assert_eq!(
            h.registry.own_state("partitions_states"),
            Some(LifecycleState::Down)
        );

        h.states.load_partitions(&[0]).await.unwrap();
        assert!(h.states.is_loaded(0));
    }

    #[rstest]
    #[tokio::test]
    async fn records_of_unloaded_partitions_pass_through(_setup: ()) {
        let h = harness(DeliverySettings::default());
        h.states.load_partitions(&[0]).await.unwrap();
        let records = vec![record(0, 1, "a"), record(9, 1, "b"), record(0, 2, "a")];
        let forwarded = h.states.record_read(Utc::now(), &records);
        assert_eq!(forwarded, vec![records[0].clone(), records[1].clone()]);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn reconfigure_replaces_the_schedule(_setup: ()) {
        let h = harness(DeliverySettings {
            state_persistence_period_seconds: 1.0,
            ..Default::default()
        });
        h.states.load_partitions(&[0]).await.unwrap();
        let (notify, _) = broadcast::channel(1);
        let task = h
            .states
            .start_persistence_task(Shutdown::new(notify.subscribe()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.store.version_of(&state_key(0)), Some(0));

        h.config
            .apply(&DeliverySettings {
                state_persistence_period_seconds: 10.0,
                ..Default::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.states.update_read_from(0, 5);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.store.version_of(&state_key(0)), Some(0));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.store.version_of(&state_key(0)), Some(1));

        // shutdown runs a final cycle
        h.states.update_read_from(0, 6);
        notify.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(h.store.version_of(&state_key(0)), Some(2));
    }
}
