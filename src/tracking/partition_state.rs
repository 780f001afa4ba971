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

//! Bookkeeping of a single log partition.
//!
//! Two offsets are kept:
//! - `last_sent_offset`, the highest offset read from the log
//! - `restart_offset`, the highest offset whose batch left the send pipeline
//!
//! Both only move forward. Unacknowledged message ids are tracked next to them, and the
//! whole state round-trips through a JSON blob stored under [`state_key`].

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::message::LogRecord;
use crate::{AppError, AppResult};

pub const PARTITION_STATE_KEY_PREFIX: &str = "partition-state-";

pub fn state_key(partition: i32) -> String {
    format!("{}{}", PARTITION_STATE_KEY_PREFIX, partition)
}

/// A message still waiting for its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessageEntry {
    pub message_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub persisted: bool,
    /// Set when the message must be forwarded again the next time it is read: it was
    /// restored from durable state, or its last forward attempt failed. Never persisted.
    redrive: bool,
}

impl TrackedMessageEntry {
    fn new(message_id: String, first_seen_at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            first_seen_at,
            persisted: false,
            redrive: false,
        }
    }

    pub fn needs_redrive(&self) -> bool {
        self.redrive
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateBlob {
    restart_offset: i64,
    last_sent_offset: i64,
    read_from_offset: Option<i64>,
    tracked: Vec<TrackedBlob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackedBlob {
    id: String,
    first_seen_millis: i64,
    persisted: bool,
}

/// What one persistence cycle wrote for a partition. Handed back to
/// [`PartitionTrackingState::mark_saved`] once the write is confirmed.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub partition: i32,
    pub value: Bytes,
    /// `None` means the state was never stored and must be created.
    pub version: Option<i32>,
    modifications: u64,
    tracked_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PartitionTrackingState {
    partition: i32,
    restart_offset: i64,
    last_sent_offset: i64,
    read_from_offset: Option<i64>,
    tracked: HashMap<String, TrackedMessageEntry>,
    stored_version: Option<i32>,
    modifications: u64,
    saved_modifications: u64,
}

impl PartitionTrackingState {
    /// Zero state of a partition that has nothing in the store yet. It is dirty, so the
    /// next persistence cycle creates it.
    pub fn new(partition: i32) -> Self {
        Self {
            partition,
            restart_offset: 0,
            last_sent_offset: 0,
            read_from_offset: None,
            tracked: HashMap::new(),
            stored_version: None,
            modifications: 1,
            saved_modifications: 0,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn restart_offset(&self) -> i64 {
        self.restart_offset
    }

    pub fn last_sent_offset(&self) -> i64 {
        self.last_sent_offset
    }

    pub fn read_from_offset(&self) -> Option<i64> {
        self.read_from_offset
    }

    pub fn stored_version(&self) -> Option<i32> {
        self.stored_version
    }

    pub fn tracked(&self) -> &HashMap<String, TrackedMessageEntry> {
        &self.tracked
    }

    pub fn is_tracked(&self, message_id: &str) -> bool {
        self.tracked.contains_key(message_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.modifications != self.saved_modifications
    }

    fn touch(&mut self) {
        self.modifications += 1;
    }

    /// Tracks every message of `records` not tracked yet and advances `last_sent_offset`.
    ///
    /// Returns the records to forward downstream: new messages, messages flagged for
    /// redrive, and everything that is not tracked at all. A message already in flight
    /// is filtered out, including a repeat of the same id inside `records`.
    pub fn record_read<'a>(
        &mut self,
        now: DateTime<Utc>,
        records: impl IntoIterator<Item = &'a LogRecord>,
    ) -> Vec<&'a LogRecord> {
        let mut forward = Vec::new();
        let mut changed = false;
        for record in records {
            if record.partition != self.partition {
                warn!(
                    "record of partition {} offered to partition {}, ignored",
                    record.partition, self.partition
                );
                continue;
            }
            if record.offset > self.last_sent_offset {
                self.last_sent_offset = record.offset;
                changed = true;
            }
            let Some(message_id) = record.tracked_message_id() else {
                forward.push(record);
                continue;
            };
            match self.tracked.get_mut(message_id) {
                None => {
                    self.tracked.insert(
                        message_id.to_string(),
                        TrackedMessageEntry::new(message_id.to_string(), now),
                    );
                    changed = true;
                    forward.push(record);
                }
                Some(entry) if entry.redrive => {
                    entry.redrive = false;
                    forward.push(record);
                }
                Some(_) => {
                    trace!(
                        "message {} already in flight on partition {}",
                        message_id,
                        self.partition
                    );
                }
            }
        }
        if changed {
            self.touch();
        }
        forward
    }

    /// Advances `restart_offset` to the highest offset of `records`, never backwards.
    pub fn record_sent<'a>(&mut self, records: impl IntoIterator<Item = &'a LogRecord>) {
        let highest = records
            .into_iter()
            .filter(|record| record.partition == self.partition)
            .map(|record| record.offset)
            .max();
        if let Some(offset) = highest {
            if offset > self.restart_offset {
                self.restart_offset = offset;
                self.touch();
            }
        }
    }

    /// Flags tracked messages so their next read forwards them again.
    pub fn mark_for_redrive<'a>(&mut self, records: impl IntoIterator<Item = &'a LogRecord>) {
        for record in records {
            if let Some(entry) = record
                .tracked_message_id()
                .and_then(|id| self.tracked.get_mut(id))
            {
                entry.redrive = true;
            }
        }
    }

    /// Stops tracking `message_id`. Returns false when it was not tracked.
    pub fn untrack(&mut self, message_id: &str) -> bool {
        if self.tracked.remove(message_id).is_some() {
            self.touch();
            true
        } else {
            false
        }
    }

    /// Raises the watermark below which every message is either acked or durably spilled.
    pub fn update_read_from(&mut self, offset: i64) {
        if self.read_from_offset.map_or(true, |current| offset > current) {
            self.read_from_offset = Some(offset);
            self.touch();
        }
    }

    /// Where the log should resume reading this partition after a restart.
    pub fn starting_offset(&self) -> i64 {
        let bounded = match self.read_from_offset {
            Some(read_from) => self.restart_offset.min(read_from),
            None => self.restart_offset,
        };
        bounded.max(0)
    }

    /// Encodes the state as it reads once stored: every entry of the blob is persisted by
    /// the write that carries it.
    pub fn serialize(&self) -> AppResult<Bytes> {
        let mut tracked: Vec<TrackedBlob> = self
            .tracked
            .values()
            .map(|entry| TrackedBlob {
                id: entry.message_id.clone(),
                first_seen_millis: entry.first_seen_at.timestamp_millis(),
                persisted: true,
            })
            .collect();
        tracked.sort_by(|a, b| a.id.cmp(&b.id));
        let blob = StateBlob {
            restart_offset: self.restart_offset,
            last_sent_offset: self.last_sent_offset,
            read_from_offset: self.read_from_offset,
            tracked,
        };
        Ok(Bytes::from(serde_json::to_vec(&blob)?))
    }

    /// Restores a stored state. Anything malformed is an error: falling back to a zero
    /// state would forget which messages are still unacknowledged.
    pub fn deserialize(partition: i32, blob: &[u8], version: i32) -> AppResult<Self> {
        let malformed = |reason: String| AppError::MalformedState { partition, reason };
        let decoded: StateBlob =
            serde_json::from_slice(blob).map_err(|e| malformed(e.to_string()))?;

        let mut tracked = HashMap::with_capacity(decoded.tracked.len());
        for entry in decoded.tracked {
            let first_seen_at = DateTime::<Utc>::from_timestamp_millis(entry.first_seen_millis)
                .ok_or_else(|| {
                    malformed(format!(
                        "first seen millis {} of {} out of range",
                        entry.first_seen_millis, entry.id
                    ))
                })?;
            tracked.insert(
                entry.id.clone(),
                TrackedMessageEntry {
                    message_id: entry.id,
                    first_seen_at,
                    persisted: entry.persisted,
                    redrive: true,
                },
            );
        }
        Ok(Self {
            partition,
            restart_offset: decoded.restart_offset,
            last_sent_offset: decoded.last_sent_offset,
            read_from_offset: decoded.read_from_offset,
            tracked,
            stored_version: Some(version),
            modifications: 0,
            saved_modifications: 0,
        })
    }

    pub fn snapshot(&self) -> AppResult<StateSnapshot> {
        Ok(StateSnapshot {
            partition: self.partition,
            value: self.serialize()?,
            version: self.stored_version,
            modifications: self.modifications,
            tracked_ids: self.tracked.keys().cloned().collect(),
        })
    }

    /// Records that `snapshot` is durable. Call only after the write of this partition
    /// was confirmed.
    pub fn mark_saved(&mut self, snapshot: &StateSnapshot) {
        self.stored_version = Some(match self.stored_version {
            None => 0,
            Some(version) => version + 1,
        });
        // mutations made while the write was in flight keep the state dirty
        self.saved_modifications = self.saved_modifications.max(snapshot.modifications);
        for id in &snapshot.tracked_ids {
            if let Some(entry) = self.tracked.get_mut(id) {
                entry.persisted = true;
            }
        }
    }
}
