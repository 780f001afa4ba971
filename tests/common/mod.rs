#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use deliverymq::message::{LogRecord, MessageHeader, OutboundMessage};
use deliverymq::{AppError, AppResult, OutboundPipeline};
use parking_lot::Mutex;

/// Pipeline that records what it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingPipeline {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingPipeline {
    pub fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|m| m.message_id().to_string())
            .collect()
    }

    pub fn times_sent(&self, message_id: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.message_id() == message_id)
            .count()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

impl OutboundPipeline for RecordingPipeline {
    async fn forward(&self, messages: Vec<OutboundMessage>) -> AppResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::PipelineError("transport down".to_string()));
        }
        self.sent.lock().extend(messages);
        Ok(())
    }
}

pub fn authenticated(partition: i32, offset: i64, id: &str) -> LogRecord {
    LogRecord::new(
        id,
        Some(OutboundMessage::Authenticated {
            header: MessageHeader::new(id, "alice", "bob"),
            payload: Bytes::from(format!("payload of {}", id)),
        }),
        partition,
        offset,
    )
}

pub fn unauthenticated(partition: i32, offset: i64, id: &str) -> LogRecord {
    LogRecord::new(
        id,
        Some(OutboundMessage::Unauthenticated {
            header: MessageHeader::new(id, "alice", "bob"),
            payload: Bytes::from_static(b"broadcast"),
        }),
        partition,
        offset,
    )
}
