pub mod cache;
pub mod delivery;
pub mod message;
pub mod service;
pub mod store;
pub mod tracking;

pub use cache::DataMessageCache;
pub use delivery::{
    AckProcessor, DelayQueueReplayScheduler, DeliveryTracker, MessageReplayer, MessagesHandler,
    OutboundPipeline, PartitionAssignmentListener, ReplayHandler, ReplayScheduler,
    StartingOffsetProvider, TrackingAssignmentListener,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ConfigHolder, DeliveryConfig,
    DeliverySettings, DeliverySnapshot, GeneralConfig, HealthHandle, HealthRegistry, HealthStatus,
    LifecycleState, Shutdown,
};
pub use store::{MemoryStateStore, RocksStateStore, StateStore};
pub use tracking::{PartitionTrackingState, PartitionsStates};
