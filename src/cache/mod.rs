//! Bounded cache of tracked outbound messages, keyed by message id.
//!
//! Entries live in memory until they are acknowledged or grow too old. Spilled entries are
//! written once to the state store under `message-cache-<id>` with their log position as
//! metadata, and are then served from there. Two rules decide what spills after a `put`:
//! - per partition, every entry older than `max_cache_offset_age` offsets behind the newest
//! - while the resident bytes exceed `max_cache_size_bytes`, the oldest entry of the partition
//!   holding the most bytes
//!
//! Each partition also keeps a read-from watermark: the lowest offset whose message is still
//! only in memory (or one past the newest when nothing is resident). It only moves forward.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, trace, warn};

use crate::message::{CacheEntry, OutboundMessage};
use crate::store::{RecordMetadata, StateStore, VersionedRecord};
use crate::{AppError, AppResult, ConfigHolder, DeliverySnapshot, HealthHandle};

pub const MESSAGE_CACHE_KEY_PREFIX: &str = "message-cache-";
const MAX_DELETE_ATTEMPTS: usize = 3;

pub fn spill_key(message_id: &str) -> String {
    format!("{}{}", MESSAGE_CACHE_KEY_PREFIX, message_id)
}

#[derive(Debug, Default)]
struct PartitionIndex {
    offsets: BTreeMap<i64, String>,
    newest: Option<i64>,
    watermark: Option<i64>,
    bytes: usize,
}

impl PartitionIndex {
    /// Returns true when the watermark moved.
    fn refresh_watermark(&mut self) -> bool {
        let candidate = match (self.offsets.keys().next(), self.newest) {
            (Some(oldest), _) => *oldest,
            (None, Some(newest)) => newest + 1,
            (None, None) => return false,
        };
        if self.watermark.map_or(true, |current| candidate > current) {
            self.watermark = Some(candidate);
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct DataMessageCache<S: StateStore> {
    entries: DashMap<String, CacheEntry>,
    partitions: DashMap<i32, PartitionIndex>,
    resident_bytes: AtomicUsize,
    store: Arc<S>,
    config: Arc<ConfigHolder>,
    health: HealthHandle,
}

impl<S: StateStore> DataMessageCache<S> {
    pub fn new(store: Arc<S>, config: Arc<ConfigHolder>, health: HealthHandle) -> Self {
        health.report_up();
        Self {
            entries: DashMap::new(),
            partitions: DashMap::new(),
            resident_bytes: AtomicUsize::new(0),
            store,
            config,
            health,
        }
    }

    pub fn health(&self) -> &HealthHandle {
        &self.health
    }

    pub fn resident_len(&self) -> usize {
        self.entries.len()
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes.load(Ordering::SeqCst)
    }

    pub fn is_resident(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub fn read_from_offset(&self, partition: i32) -> Option<i64> {
        self.partitions
            .get(&partition)
            .and_then(|index| index.watermark)
    }

    /// Looks the entry up in memory, then in the state store.
    pub async fn get(&self, message_id: &str) -> AppResult<Option<CacheEntry>> {
        if let Some(entry) = self.entries.get(message_id) {
            return Ok(Some(entry.value().clone()));
        }
        let mut records = self.store.get(vec![spill_key(message_id)]).await?;
        match records.pop() {
            Some(record) => Ok(Some(Self::decode(message_id, &record)?)),
            None => Ok(None),
        }
    }

    /// Inserts `entries`, overwriting by id, then applies the spill rules.
    ///
    /// Returns the partitions whose read-from watermark moved.
    pub async fn put(&self, entries: Vec<CacheEntry>) -> Vec<i32> {
        if entries.is_empty() {
            return Vec::new();
        }
        let mut touched = BTreeSet::new();
        for entry in entries {
            touched.insert(entry.partition);
            if let Some(previous) = self.entries.insert(entry.message_id.clone(), entry.clone()) {
                self.unindex(&previous);
            }
            let size = entry.size();
            let mut index = self.partitions.entry(entry.partition).or_default();
            index.offsets.insert(entry.offset, entry.message_id);
            index.newest = Some(index.newest.map_or(entry.offset, |n| n.max(entry.offset)));
            index.bytes += size;
            drop(index);
            self.resident_bytes.fetch_add(size, Ordering::SeqCst);
        }

        let limits = self.config.current();
        let candidates = self.select_spill(&touched, &limits);
        if !candidates.is_empty() {
            touched.extend(self.spill(candidates).await);
        }

        touched
            .into_iter()
            .filter(|p| self.refresh_watermark(*p))
            .collect()
    }

    /// Removes an acknowledged entry from memory, or from the state store when spilled.
    ///
    /// Returns `None` when the entry is unknown, including when a concurrent remove won.
    pub async fn remove(&self, message_id: &str) -> AppResult<Option<CacheEntry>> {
        if let Some((_, entry)) = self.entries.remove(message_id) {
            self.unindex(&entry);
            self.refresh_watermark(entry.partition);
            trace!("removed {} from memory", message_id);
            return Ok(Some(entry));
        }

        let key = spill_key(message_id);
        let Some(record) = self.store.get(vec![key.clone()]).await?.pop() else {
            return Ok(None);
        };
        let entry = Self::decode(message_id, &record)?;

        for attempt in 1..=MAX_DELETE_ATTEMPTS {
            let tombstone = VersionedRecord::new(key.clone(), Bytes::new(), record.version);
            match self.store.delete(vec![tombstone]).await {
                Ok(failures) if failures.is_empty() => {
                    debug!("removed spilled entry {}", key);
                    return Ok(Some(entry));
                }
                Ok(failures) if failures.iter().all(|f| f.is_conflict()) => {
                    debug!("spilled entry {} already removed", key);
                    return Ok(None);
                }
                Ok(failures) => warn!(
                    "deleting {} failed (attempt {}/{}): {:?}",
                    key, attempt, MAX_DELETE_ATTEMPTS, failures
                ),
                Err(e) => warn!(
                    "deleting {} failed (attempt {}/{}): {}",
                    key, attempt, MAX_DELETE_ATTEMPTS, e
                ),
            }
        }
        error!(
            "giving up deleting {} after {} attempts, it stays in the state store",
            key, MAX_DELETE_ATTEMPTS
        );
        Ok(Some(entry))
    }

    /// Drops the resident entries of revoked partitions. Spilled copies stay durable.
    pub fn forget_partitions(&self, partitions: &[i32]) {
        for partition in partitions {
            let Some((_, index)) = self.partitions.remove(partition) else {
                continue;
            };
            let mut dropped = 0;
            for id in index.offsets.values() {
                if let Some((_, entry)) = self
                    .entries
                    .remove_if(id, |_, entry| entry.partition == *partition)
                {
                    self.resident_bytes.fetch_sub(entry.size(), Ordering::SeqCst);
                    dropped += 1;
                }
            }
            debug!("dropped {} cache entries of partition {}", dropped, partition);
        }
    }

    fn refresh_watermark(&self, partition: i32) -> bool {
        self.partitions
            .get_mut(&partition)
            .map(|mut index| index.refresh_watermark())
            .unwrap_or(false)
    }

    fn unindex(&self, entry: &CacheEntry) {
        let size = entry.size();
        self.resident_bytes.fetch_sub(size, Ordering::SeqCst);
        if let Some(mut index) = self.partitions.get_mut(&entry.partition) {
            if index.offsets.get(&entry.offset) == Some(&entry.message_id) {
                index.offsets.remove(&entry.offset);
            }
            index.bytes = index.bytes.saturating_sub(size);
        }
    }

    fn select_spill(&self, touched: &BTreeSet<i32>, limits: &DeliverySnapshot) -> Vec<CacheEntry> {
        let mut selected: Vec<String> = Vec::new();
        for partition in touched {
            if let Some(index) = self.partitions.get(partition) {
                if let Some(newest) = index.newest {
                    let threshold = newest.saturating_sub(limits.max_cache_offset_age);
                    selected.extend(index.offsets.range(..threshold).map(|(_, id)| id.clone()));
                }
            }
        }
        let mut candidates: Vec<CacheEntry> = selected
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.value().clone()))
            .collect();

        let mut resident = self.resident_bytes() as u64;
        let mut aged_bytes: HashMap<i32, u64> = HashMap::new();
        for candidate in &candidates {
            let size = candidate.size() as u64;
            resident = resident.saturating_sub(size);
            *aged_bytes.entry(candidate.partition).or_default() += size;
        }
        if resident <= limits.max_cache_size_bytes {
            return candidates;
        }

        let by_age: HashSet<String> = selected.into_iter().collect();
        let mut remaining: Vec<(u64, VecDeque<String>)> = self
            .partitions
            .iter()
            .map(|index| {
                let aged = aged_bytes.get(index.key()).copied().unwrap_or(0);
                let ids: VecDeque<String> = index
                    .offsets
                    .values()
                    .filter(|id| !by_age.contains(*id))
                    .cloned()
                    .collect();
                ((index.bytes as u64).saturating_sub(aged), ids)
            })
            .collect();

        while resident > limits.max_cache_size_bytes {
            let Some((bytes, ids)) = remaining
                .iter_mut()
                .filter(|(_, ids)| !ids.is_empty())
                .max_by_key(|(bytes, _)| *bytes)
            else {
                break;
            };
            let Some(id) = ids.pop_front() else { break };
            if let Some(entry) = self.entries.get(&id).map(|e| e.value().clone()) {
                let size = entry.size() as u64;
                *bytes = bytes.saturating_sub(size);
                resident = resident.saturating_sub(size);
                candidates.push(entry);
            }
        }
        candidates
    }

    /// Writes `candidates` to the state store and drops the written ones from memory.
    ///
    /// Returns the partitions that lost resident entries.
    async fn spill(&self, candidates: Vec<CacheEntry>) -> BTreeSet<i32> {
        let mut spilled = BTreeSet::new();
        let mut records = Vec::with_capacity(candidates.len());
        let mut written: HashSet<String> = HashSet::with_capacity(candidates.len());
        for entry in &candidates {
            match serde_json::to_vec(&entry.message) {
                Ok(value) => {
                    let key = spill_key(&entry.message_id);
                    written.insert(key.clone());
                    records.push(VersionedRecord::new(key, value, 0).with_metadata(
                        RecordMetadata {
                            partition: entry.partition,
                            offset: entry.offset,
                        },
                    ));
                }
                Err(e) => error!("cannot encode cache entry {}: {}", entry.message_id, e),
            }
        }

        let failures = match self.store.create(records).await {
            Ok(failures) => failures,
            Err(e) => {
                error!(
                    "spilling {} cache entries failed, keeping them in memory: {}",
                    candidates.len(),
                    e
                );
                self.health.report_error();
                return spilled;
            }
        };
        for failure in &failures {
            if failure.is_conflict() {
                // a previous run already spilled it
                debug!("{} already in the state store", failure.key);
            } else {
                error!("spilling {} failed, keeping it in memory: {:?}", failure.key, failure.failure);
                written.remove(&failure.key);
            }
        }
        if written.len() < candidates.len() {
            self.health.report_error();
        }

        let mut orphaned = Vec::new();
        for entry in candidates {
            let key = spill_key(&entry.message_id);
            if !written.contains(&key) {
                continue;
            }
            let evicted = self.entries.remove_if(&entry.message_id, |_, resident| {
                resident.partition == entry.partition && resident.offset == entry.offset
            });
            match evicted {
                Some((_, resident)) => {
                    self.unindex(&resident);
                    spilled.insert(resident.partition);
                }
                // acknowledged while being written
                None => orphaned.push(VersionedRecord::new(key, Bytes::new(), 0)),
            }
        }
        trace!("spilled {} cache entries", written.len() - orphaned.len());

        if !orphaned.is_empty() {
            match self.store.delete(orphaned).await {
                Ok(failures) if failures.is_empty() => {}
                Ok(failures) => warn!("cannot delete acknowledged spilled entries: {:?}", failures),
                Err(e) => warn!("cannot delete acknowledged spilled entries: {}", e),
            }
        }
        spilled
    }

    fn decode(message_id: &str, record: &VersionedRecord) -> AppResult<CacheEntry> {
        let message: OutboundMessage = serde_json::from_slice(&record.value)?;
        let metadata = record.metadata.ok_or_else(|| {
            AppError::IllegalStateError(format!("spilled entry {} has no log position", record.key))
        })?;
        Ok(CacheEntry {
            message_id: message_id.to_string(),
            partition: metadata.partition,
            offset: metadata.offset,
            message,
        })
    }
}
