//! Delivery path: ingress, acknowledgements, replays and partition assignment.
//!
//! The transport and the log are outside this crate; they are reached through the traits
//! declared here.

use std::future::Future;
use std::time::Duration;

use crate::message::{CounterpartyKey, OutboundMessage};
use crate::AppResult;

mod ack_processor;
mod messages_handler;
mod rebalance;
mod replay_scheduler;
mod replayer;
mod tracker;

pub use ack_processor::AckProcessor;
pub use messages_handler::MessagesHandler;
pub use rebalance::{PartitionAssignmentListener, StartingOffsetProvider, TrackingAssignmentListener};
pub use replay_scheduler::DelayQueueReplayScheduler;
pub use replayer::MessageReplayer;
pub use tracker::DeliveryTracker;

/// Outbound send pipeline of the transport layer.
pub trait OutboundPipeline: Send + Sync + 'static {
    /// Completes once every message was handed to the transport.
    fn forward(&self, messages: Vec<OutboundMessage>) -> impl Future<Output = AppResult<()>> + Send;
}

/// Periodic re-send of unacknowledged messages, keyed by message id and counterparties.
pub trait ReplayScheduler: Send + Sync + 'static {
    /// Schedules a replay every `period`. Scheduling an already scheduled message is a no-op.
    fn schedule(
        &self,
        message_id: &str,
        key: &CounterpartyKey,
        period: Duration,
    ) -> impl Future<Output = AppResult<()>> + Send;

    fn cancel(
        &self,
        message_id: &str,
        key: &CounterpartyKey,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

/// Callback run when a scheduled replay is due.
pub trait ReplayHandler: Send + Sync + 'static {
    /// Returns false when the message is gone and the replay should not be rescheduled.
    fn replay(&self, message_id: String, key: CounterpartyKey) -> impl Future<Output = bool> + Send;
}
