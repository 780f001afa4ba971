use serde::{Deserialize, Serialize};

use super::OutboundMessage;

/// One record delivered by the log for an assigned partition.
///
/// A `None` value is a tombstone, it carries no message but still advances offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: String,
    pub value: Option<OutboundMessage>,
    pub partition: i32,
    pub offset: i64,
}

impl LogRecord {
    pub fn new(
        key: impl Into<String>,
        value: Option<OutboundMessage>,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            partition,
            offset,
        }
    }

    /// Message id when this record carries a message that must be tracked until acked.
    pub fn tracked_message_id(&self) -> Option<&str> {
        self.value
            .as_ref()
            .filter(|message| message.is_tracked())
            .map(|message| message.message_id())
    }

    pub fn to_cache_entry(&self) -> Option<CacheEntry> {
        match &self.value {
            Some(message) if message.is_tracked() => Some(CacheEntry {
                message_id: message.message_id().to_string(),
                partition: self.partition,
                offset: self.offset,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

/// A tracked message held by the data message cache, with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub message_id: String,
    pub partition: i32,
    pub offset: i64,
    pub message: OutboundMessage,
}

impl CacheEntry {
    pub fn size(&self) -> usize {
        self.message.approximate_size()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::MessageHeader;

    fn authenticated(id: &str) -> OutboundMessage {
        OutboundMessage::Authenticated {
            header: MessageHeader::new(id, "alice", "bob"),
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn only_authenticated_messages_become_cache_entries() {
        let tracked = LogRecord::new("k", Some(authenticated("m1")), 3, 17);
        let entry = tracked.to_cache_entry().unwrap();
        assert_eq!(entry.message_id, "m1");
        assert_eq!((entry.partition, entry.offset), (3, 17));
        assert_eq!(tracked.tracked_message_id(), Some("m1"));

        let untracked = LogRecord::new(
            "k",
            Some(OutboundMessage::Unauthenticated {
                header: MessageHeader::new("m2", "alice", "bob"),
                payload: Bytes::new(),
            }),
            3,
            18,
        );
        assert!(untracked.to_cache_entry().is_none());
        assert!(untracked.tracked_message_id().is_none());

        let tombstone = LogRecord::new("k", None, 3, 19);
        assert!(tombstone.to_cache_entry().is_none());
    }
}
