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

use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use tracing::{error, info, trace};

use super::{KeyFailure, RecordMetadata, StateStore, VersionedRecord};
use crate::AppResult;

/// What is written under each key: the value with its version and optional metadata.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: Bytes,
    metadata: Option<RecordMetadata>,
    version: i32,
}

/// [`StateStore`] backed by a local RocksDB instance.
///
/// Version checks and writes happen under one write lock, so check-then-write is
/// atomic per key with respect to other writers of this process.
pub struct RocksStateStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStateStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        info!("state store opened at {}", path.as_ref().display());
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Keys starting with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> AppResult<Vec<VersionedRecord>> {
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        let mut records = Vec::new();
        for item in self.db.iterator(mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8_lossy(&key).to_string();
            records.push(Self::decode(key, &value)?);
        }
        Ok(records)
    }

    fn decode(key: String, raw: &[u8]) -> AppResult<VersionedRecord> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        Ok(VersionedRecord {
            key,
            value: envelope.value,
            metadata: envelope.metadata,
            version: envelope.version,
        })
    }

    fn stored_version(&self, key: &str) -> Result<Option<i32>, KeyFailure> {
        match self.db.get(key) {
            Ok(Some(raw)) => serde_json::from_slice::<Envelope>(&raw)
                .map(|envelope| Some(envelope.version))
                .map_err(|e| KeyFailure::io(key, e.to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(KeyFailure::io(key, e.to_string())),
        }
    }

    fn put(&self, record: VersionedRecord, version: i32) -> Option<KeyFailure> {
        let envelope = Envelope {
            value: record.value,
            metadata: record.metadata,
            version,
        };
        let encoded = match serde_json::to_vec(&envelope) {
            Ok(encoded) => encoded,
            Err(e) => return Some(KeyFailure::io(record.key, e.to_string())),
        };
        match self.db.put(&record.key, encoded) {
            Ok(()) => {
                trace!("stored {} at version {}", record.key, version);
                None
            }
            Err(e) => {
                error!("rocksdb put {} failed: {}", record.key, e);
                Some(KeyFailure::io(record.key, e.to_string()))
            }
        }
    }
}

impl StateStore for RocksStateStore {
    async fn get(&self, keys: Vec<String>) -> AppResult<Vec<VersionedRecord>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.db.get(&key)? {
                records.push(Self::decode(key, &raw)?);
            }
        }
        Ok(records)
    }

    async fn create(&self, records: Vec<VersionedRecord>) -> AppResult<Vec<KeyFailure>> {
        let _guard = self.write_lock.lock();
        let mut failures = Vec::new();
        for record in records {
            match self.stored_version(&record.key) {
                Ok(None) => failures.extend(self.put(record, 0)),
                Ok(Some(_)) => failures.push(KeyFailure::conflict(record.key)),
                Err(failure) => failures.push(failure),
            }
        }
        Ok(failures)
    }

    async fn update(&self, records: Vec<VersionedRecord>) -> AppResult<Vec<KeyFailure>> {
        let _guard = self.write_lock.lock();
        let mut failures = Vec::new();
        for record in records {
            match self.stored_version(&record.key) {
                Ok(Some(version)) if version == record.version => {
                    failures.extend(self.put(record, version + 1))
                }
                Ok(_) => failures.push(KeyFailure::conflict(record.key)),
                Err(failure) => failures.push(failure),
            }
        }
        Ok(failures)
    }

    async fn delete(&self, records: Vec<VersionedRecord>) -> AppResult<Vec<KeyFailure>> {
        let _guard = self.write_lock.lock();
        let mut failures = Vec::new();
        for record in records {
            match self.stored_version(&record.key) {
                Ok(Some(version)) if version == record.version => {
                    if let Err(e) = self.db.delete(&record.key) {
                        failures.push(KeyFailure::io(record.key, e.to_string()));
                    }
                }
                Ok(_) => failures.push(KeyFailure::conflict(record.key)),
                Err(failure) => failures.push(failure),
            }
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn versions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStateStore::open(dir.path()).unwrap();
            let record = VersionedRecord::new("message-cache-m1", "payload", 0)
                .with_metadata(RecordMetadata {
                    partition: 2,
                    offset: 40,
                });
            assert!(store.create(vec![record]).await.unwrap().is_empty());
            assert!(store
                .update(vec![VersionedRecord::new("message-cache-m1", "next", 0)])
                .await
                .unwrap()
                .is_empty());
        }

        let store = RocksStateStore::open(dir.path()).unwrap();
        let records = store
            .get(vec!["message-cache-m1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, 1);
        assert_eq!(records[0].value.as_ref(), b"next");
        // update replaces the whole record, metadata included
        assert_eq!(records[0].metadata, None);
    }

    #[tokio::test]
    async fn conflicts_are_reported_per_key() {
        let dir = TempDir::new().unwrap();
        let store = RocksStateStore::open(dir.path()).unwrap();
        store
            .create(vec![VersionedRecord::new("a", "1", 0)])
            .await
            .unwrap();

        let failures = store
            .create(vec![
                VersionedRecord::new("a", "dup", 0),
                VersionedRecord::new("b", "2", 0),
            ])
            .await
            .unwrap();
        assert_eq!(failures, vec![KeyFailure::conflict("a")]);

        let failures = store
            .delete(vec![
                VersionedRecord::new("a", "", 5),
                VersionedRecord::new("b", "", 0),
            ])
            .await
            .unwrap();
        assert_eq!(failures, vec![KeyFailure::conflict("a")]);
        assert!(store.get(vec!["b".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_prefix_stops_at_prefix_end() {
        let dir = TempDir::new().unwrap();
        let store = RocksStateStore::open(dir.path()).unwrap();
        store
            .create(vec![
                VersionedRecord::new("partition-state-0", "a", 0),
                VersionedRecord::new("partition-state-1", "b", 0),
                VersionedRecord::new("zzz", "c", 0),
            ])
            .await
            .unwrap();
        let records = store.scan_prefix("partition-state-").unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["partition-state-0", "partition-state-1"]);
    }
}
