use std::sync::Arc;

use tracing::{debug, warn};

use super::{OutboundPipeline, ReplayHandler};
use crate::cache::DataMessageCache;
use crate::message::CounterpartyKey;
use crate::store::StateStore;
use crate::ConfigHolder;

/// Re-sends a cached message when its replay is due.
#[derive(Debug)]
pub struct MessageReplayer<S: StateStore, P> {
    cache: Arc<DataMessageCache<S>>,
    pipeline: Arc<P>,
    config: Arc<ConfigHolder>,
}

impl<S: StateStore, P: OutboundPipeline> MessageReplayer<S, P> {
    pub fn new(cache: Arc<DataMessageCache<S>>, pipeline: Arc<P>, config: Arc<ConfigHolder>) -> Self {
        Self {
            cache,
            pipeline,
            config,
        }
    }
}

impl<S: StateStore, P: OutboundPipeline> ReplayHandler for MessageReplayer<S, P> {
    async fn replay(&self, message_id: String, key: CounterpartyKey) -> bool {
        let entry = match self.cache.get(&message_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("message {} for {} acknowledged meanwhile, no replay", message_id, key);
                return false;
            }
            Err(e) => {
                warn!("cannot look up {} for replay: {}", message_id, e);
                return true;
            }
        };

        let timeout = self.config.current().outbound_batch_timeout;
        match tokio::time::timeout(timeout, self.pipeline.forward(vec![entry.message])).await {
            Ok(Ok(())) => debug!("replayed {} to {}", message_id, key),
            Ok(Err(e)) => warn!("replay of {} to {} failed: {}", message_id, key, e),
            Err(_) => warn!("replay of {} to {} timed out after {:?}", message_id, key, timeout),
        }
        true
    }
}
