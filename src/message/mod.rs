pub use log_record::{CacheEntry, LogRecord};
pub use outbound::{AckMessage, CounterpartyKey, MessageHeader, OutboundMessage};

mod log_record;
mod outbound;
