use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::trace;

use super::{KeyFailure, StateStore, VersionedRecord};
use crate::{AppError, AppResult};

/// In-process [`StateStore`].
///
/// Used by tests and embedded setups. Failures can be injected per key or for whole
/// calls to drive the retry and fail-fast paths of the callers.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: DashMap<String, VersionedRecord>,
    conflict_keys: DashSet<String>,
    io_failure_keys: DashSet<String>,
    failing_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write touching `key` reports a version conflict until cleared.
    pub fn inject_conflict(&self, key: impl Into<String>) {
        self.conflict_keys.insert(key.into());
    }

    /// Every write touching `key` reports a per-key I/O failure until cleared.
    pub fn inject_io_failure(&self, key: impl Into<String>) {
        self.io_failure_keys.insert(key.into());
    }

    /// The next `calls` store calls fail as a whole.
    pub fn fail_next_calls(&self, calls: usize) {
        self.failing_calls.store(calls, Ordering::SeqCst);
    }

    pub fn clear_injected_failures(&self) {
        self.conflict_keys.clear();
        self.io_failure_keys.clear();
        self.failing_calls.store(0, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn version_of(&self, key: &str) -> Option<i32> {
        self.records.get(key).map(|r| r.version)
    }

    /// Number of create, update and delete calls seen, including failed ones.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn check_call(&self) -> AppResult<()> {
        let failed = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AppError::StoreUnavailable(
                "injected store failure".to_string(),
            ));
        }
        Ok(())
    }

    fn injected_failure(&self, key: &str) -> Option<KeyFailure> {
        if self.conflict_keys.contains(key) {
            Some(KeyFailure::conflict(key))
        } else if self.io_failure_keys.contains(key) {
            Some(KeyFailure::io(key, "injected key failure"))
        } else {
            None
        }
    }

    fn begin_write(&self) -> AppResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_call()
    }
}

impl StateStore for MemoryStateStore {
    async fn get(&self, keys: Vec<String>) -> AppResult<Vec<VersionedRecord>> {
        self.check_call()?;
        Ok(keys
            .iter()
            .filter_map(|key| self.records.get(key).map(|r| r.value().clone()))
            .collect())
    }

    async fn create(&self, records: Vec<VersionedRecord>) -> AppResult<Vec<KeyFailure>> {
        self.begin_write()?;
        let mut failures = Vec::new();
        for mut record in records {
            if let Some(failure) = self.injected_failure(&record.key) {
                failures.push(failure);
                continue;
            }
            match self.records.entry(record.key.clone()) {
                Entry::Occupied(_) => failures.push(KeyFailure::conflict(record.key)),
                Entry::Vacant(vacant) => {
                    trace!("create {}", record.key);
                    record.version = 0;
                    vacant.insert(record);
                }
            }
        }
        Ok(failures)
    }

    async fn update(&self, records: Vec<VersionedRecord>) -> AppResult<Vec<KeyFailure>> {
        self.begin_write()?;
        let mut failures = Vec::new();
        for mut record in records {
            if let Some(failure) = self.injected_failure(&record.key) {
                failures.push(failure);
                continue;
            }
            match self.records.get_mut(&record.key) {
                Some(mut stored) if stored.version == record.version => {
                    trace!("update {} from version {}", record.key, record.version);
                    record.version += 1;
                    *stored = record;
                }
                _ => failures.push(KeyFailure::conflict(record.key)),
            }
        }
        Ok(failures)
    }

    async fn delete(&self, records: Vec<VersionedRecord>) -> AppResult<Vec<KeyFailure>> {
        self.begin_write()?;
        let mut failures = Vec::new();
        for record in records {
            if let Some(failure) = self.injected_failure(&record.key) {
                failures.push(failure);
                continue;
            }
            let removed = self
                .records
                .remove_if(&record.key, |_, stored| stored.version == record.version);
            if removed.is_none() {
                failures.push(KeyFailure::conflict(record.key));
            }
        }
        Ok(failures)
    }
}
