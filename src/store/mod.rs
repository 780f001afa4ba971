//! Versioned key-value state store used for durable bookkeeping.
//!
//! Every record carries an explicit version for optimistic concurrency:
//! - `create` stores version 0 and fails with [`StoreFailure::Conflict`] if the key exists
//! - `update` and `delete` succeed only when the supplied version equals the stored one;
//!   `update` stores `version + 1`
//!
//! Writes are best effort per batch: they report the keys that failed instead of
//! aborting. A call that fails as a whole (store unreachable) returns `Err`.

use std::future::Future;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::AppResult;

mod memory;
mod rocks;

pub use memory::MemoryStateStore;
pub use rocks::RocksStateStore;

/// Log position stored next to a spilled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub key: String,
    pub value: Bytes,
    pub metadata: Option<RecordMetadata>,
    pub version: i32,
}

impl VersionedRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, version: i32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: None,
            version,
        }
    }

    pub fn with_metadata(mut self, metadata: RecordMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFailure {
    /// Key already exists on create, or version mismatch / missing key on update and delete.
    Conflict,
    /// Technical failure for this key only.
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub key: String,
    pub failure: StoreFailure,
}

impl KeyFailure {
    pub fn conflict(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            failure: StoreFailure::Conflict,
        }
    }

    pub fn io(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            failure: StoreFailure::Io(reason.into()),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.failure == StoreFailure::Conflict
    }
}

pub trait StateStore: Send + Sync + 'static {
    /// Returns the records that exist among `keys`; absent keys are simply missing.
    fn get(&self, keys: Vec<String>) -> impl Future<Output = AppResult<Vec<VersionedRecord>>> + Send;

    fn create(
        &self,
        records: Vec<VersionedRecord>,
    ) -> impl Future<Output = AppResult<Vec<KeyFailure>>> + Send;

    fn update(
        &self,
        records: Vec<VersionedRecord>,
    ) -> impl Future<Output = AppResult<Vec<KeyFailure>>> + Send;

    fn delete(
        &self,
        records: Vec<VersionedRecord>,
    ) -> impl Future<Output = AppResult<Vec<KeyFailure>>> + Send;
}
