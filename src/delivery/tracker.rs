use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, trace};

use super::{
    AckProcessor, DelayQueueReplayScheduler, MessageReplayer, MessagesHandler, OutboundPipeline,
    TrackingAssignmentListener,
};
use crate::cache::DataMessageCache;
use crate::store::StateStore;
use crate::tracking::PartitionsStates;
use crate::{ConfigHolder, HealthRegistry, HealthStatus, Shutdown};

const PARTITIONS_STATES: &str = "partitions_states";
const MESSAGE_CACHE: &str = "message_cache";
const REPLAY_SCHEDULER: &str = "replay_scheduler";
const DELIVERY_TRACKER: &str = "delivery_tracker";

/// The assembled tracker: every component wired to one store, one pipeline and one
/// configuration holder, with its background tasks running.
pub struct DeliveryTracker<S: StateStore, P: OutboundPipeline> {
    registry: Arc<HealthRegistry>,
    states: Arc<PartitionsStates<S>>,
    cache: Arc<DataMessageCache<S>>,
    messages_handler: MessagesHandler<S, P, DelayQueueReplayScheduler>,
    ack_processor: AckProcessor<S, DelayQueueReplayScheduler>,
    assignment_listener: TrackingAssignmentListener<S, DelayQueueReplayScheduler>,
    notify_shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: StateStore, P: OutboundPipeline> DeliveryTracker<S, P> {
    /// Builds the components and starts the persistence and replay tasks.
    /// Must be called within a tokio runtime.
    pub fn start(store: Arc<S>, pipeline: Arc<P>, config: Arc<ConfigHolder>) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        let registry = HealthRegistry::new();
        let tracker_health = registry.register(
            DELIVERY_TRACKER,
            &[PARTITIONS_STATES, MESSAGE_CACHE, REPLAY_SCHEDULER],
        );

        let states = Arc::new(PartitionsStates::new(
            store.clone(),
            config.clone(),
            registry.register(PARTITIONS_STATES, &[]),
        ));
        let cache = Arc::new(DataMessageCache::new(
            store,
            config.clone(),
            registry.register(MESSAGE_CACHE, &[]),
        ));

        let replayer = Arc::new(MessageReplayer::new(
            cache.clone(),
            pipeline.clone(),
            config.clone(),
        ));
        let scheduler_health = registry.register(REPLAY_SCHEDULER, &[]);
        let (scheduler, replay_task) = DelayQueueReplayScheduler::start(
            replayer,
            Shutdown::new(notify_shutdown.subscribe()),
        );
        scheduler_health.report_up();
        let scheduler = Arc::new(scheduler);

        let persistence_task =
            states.start_persistence_task(Shutdown::new(notify_shutdown.subscribe()));

        let messages_handler = MessagesHandler::new(
            cache.clone(),
            states.clone(),
            pipeline,
            scheduler.clone(),
            config.clone(),
        );
        let ack_processor = AckProcessor::new(cache.clone(), states.clone(), scheduler.clone());
        let assignment_listener =
            TrackingAssignmentListener::new(states.clone(), cache.clone(), scheduler, config);
        tracker_health.report_up();
        info!("delivery tracker started");

        DeliveryTracker {
            registry,
            states,
            cache,
            messages_handler,
            ack_processor,
            assignment_listener,
            notify_shutdown,
            tasks: vec![replay_task, persistence_task],
        }
    }

    pub fn messages_handler(&self) -> &MessagesHandler<S, P, DelayQueueReplayScheduler> {
        &self.messages_handler
    }

    pub fn ack_processor(&self) -> &AckProcessor<S, DelayQueueReplayScheduler> {
        &self.ack_processor
    }

    pub fn assignment_listener(&self) -> &TrackingAssignmentListener<S, DelayQueueReplayScheduler> {
        &self.assignment_listener
    }

    pub fn states(&self) -> &Arc<PartitionsStates<S>> {
        &self.states
    }

    pub fn cache(&self) -> &Arc<DataMessageCache<S>> {
        &self.cache
    }

    pub fn health_registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn health(&self) -> HealthStatus {
        self.registry.status()
    }

    /// Stops the background tasks. The persistence task writes dirty states one last time.
    pub async fn shutdown(self) {
        trace!("sending tracker shutdown signal");
        // no receiver left means every task is already gone
        let _ = self.notify_shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("tracker task ended abnormally: {}", e);
            }
        }
        info!("delivery tracker shutdown complete");
    }
}
