//! Per-partition delivery bookkeeping and its persistence.

mod partition_state;
mod partitions_states;

pub use partition_state::{
    state_key, PartitionTrackingState, StateSnapshot, TrackedMessageEntry,
    PARTITION_STATE_KEY_PREFIX,
};
pub use partitions_states::{PartitionsStates, PersistenceOutcome};
