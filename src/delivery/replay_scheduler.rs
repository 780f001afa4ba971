use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;
use tracing::{debug, trace};

use super::{ReplayHandler, ReplayScheduler};
use crate::message::CounterpartyKey;
use crate::{AppError, AppResult, Shutdown};

type ReplayId = (String, CounterpartyKey);

#[derive(Debug)]
enum ReplayOp {
    Schedule(ReplayId, Duration),
    Cancel(ReplayId),
    /// sent by a finished replay task; `keep` is false when the message is gone
    Completed(ReplayId, bool),
}

#[derive(Debug)]
struct ReplaySlot {
    period: Duration,
    /// None while the replay callback runs
    delay_key: Option<Key>,
}

/// [`ReplayScheduler`] driven by a single task owning a [`DelayQueue`].
///
/// A due replay is taken out of the queue while its callback runs and put back only once
/// the callback finished, so a message never has two replays in flight.
#[derive(Debug, Clone)]
pub struct DelayQueueReplayScheduler {
    ops_tx: Sender<ReplayOp>,
}

impl DelayQueueReplayScheduler {
    pub fn start<H: ReplayHandler>(handler: Arc<H>, shutdown: Shutdown) -> (Self, JoinHandle<()>) {
        let (ops_tx, ops_rx) = mpsc::channel(1000);
        let driver = tokio::spawn(Self::run(handler, ops_tx.clone(), ops_rx, shutdown));
        (Self { ops_tx }, driver)
    }

    async fn send(&self, op: ReplayOp) -> AppResult<()> {
        self.ops_tx
            .send(op)
            .await
            .map_err(|e| AppError::ChannelSendError(format!("replay scheduler stopped: {:?}", e.0)))
    }

    async fn run<H: ReplayHandler>(
        handler: Arc<H>,
        ops_tx: Sender<ReplayOp>,
        mut ops_rx: Receiver<ReplayOp>,
        mut shutdown: Shutdown,
    ) {
        let mut delay_queue: DelayQueue<ReplayId> = DelayQueue::new();
        let mut slots: HashMap<ReplayId, ReplaySlot> = HashMap::new();

        loop {
            tokio::select! {
                Some(op) = ops_rx.recv() => match op {
                    ReplayOp::Schedule(id, period) => {
                        if slots.contains_key(&id) {
                            continue;
                        }
                        let delay_key = delay_queue.insert(id.clone(), period);
                        trace!("replay of {} for {} every {:?}", id.0, id.1, period);
                        slots.insert(id, ReplaySlot { period, delay_key: Some(delay_key) });
                    }
                    ReplayOp::Cancel(id) => {
                        if let Some(slot) = slots.remove(&id) {
                            if let Some(delay_key) = slot.delay_key {
                                delay_queue.remove(&delay_key);
                            }
                            trace!("replay of {} for {} cancelled", id.0, id.1);
                        }
                    }
                    ReplayOp::Completed(id, keep) => {
                        // a slot holding a key was cancelled and scheduled anew while running
                        let Some(slot) = slots.get_mut(&id).filter(|s| s.delay_key.is_none())
                        else {
                            continue;
                        };
                        if keep {
                            slot.delay_key = Some(delay_queue.insert(id, slot.period));
                        } else {
                            slots.remove(&id);
                        }
                    }
                },
                Some(expired) = delay_queue.next() => {
                    let id = expired.into_inner();
                    let Some(slot) = slots.get_mut(&id) else {
                        continue;
                    };
                    slot.delay_key = None;
                    let handler = Arc::clone(&handler);
                    let ops_tx = ops_tx.clone();
                    tokio::spawn(async move {
                        let keep = handler.replay(id.0.clone(), id.1.clone()).await;
                        // the driver may be gone on shutdown
                        let _ = ops_tx.send(ReplayOp::Completed(id, keep)).await;
                    });
                }
                _ = shutdown.recv() => {
                    debug!("replay scheduler stopping with {} scheduled replays", slots.len());
                    break;
                }
            }
        }
    }
}

impl ReplayScheduler for DelayQueueReplayScheduler {
    async fn schedule(
        &self,
        message_id: &str,
        key: &CounterpartyKey,
        period: Duration,
    ) -> AppResult<()> {
        self.send(ReplayOp::Schedule((message_id.to_string(), key.clone()), period))
            .await
    }

    async fn cancel(&self, message_id: &str, key: &CounterpartyKey) -> AppResult<()> {
        self.send(ReplayOp::Cancel((message_id.to_string(), key.clone())))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dashmap::DashMap;
    use tokio::sync::broadcast;

    use super::*;

    #[derive(Default)]
    struct CountingHandler {
        calls: DashMap<String, usize>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        work: Duration,
        gone: Option<String>,
    }

    impl CountingHandler {
        fn calls(&self, id: &str) -> usize {
            self.calls.get(id).map(|c| *c).unwrap_or(0)
        }
    }

    impl ReplayHandler for CountingHandler {
        async fn replay(&self, message_id: String, _key: CounterpartyKey) -> bool {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            *self.calls.entry(message_id.clone()).or_default() += 1;
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.gone.as_deref() != Some(message_id.as_str())
        }
    }

    fn key() -> CounterpartyKey {
        CounterpartyKey {
            source: "alice".to_string(),
            destination: "bob".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replays_until_cancelled() {
        let handler = Arc::new(CountingHandler::default());
        let (notify, _) = broadcast::channel(1);
        let (scheduler, driver) =
            DelayQueueReplayScheduler::start(handler.clone(), Shutdown::new(notify.subscribe()));

        let period = Duration::from_secs(2);
        scheduler.schedule("m1", &key(), period).await.unwrap();
        // a second schedule does not double the rate
        scheduler.schedule("m1", &key(), period).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(handler.calls("m1"), 2);

        scheduler.cancel("m1", &key()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.calls("m1"), 2);

        notify.send(()).unwrap();
        driver.await.unwrap();
        assert!(scheduler.schedule("m2", &key(), period).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn one_replay_in_flight_per_message() {
        let handler = Arc::new(CountingHandler {
            work: Duration::from_secs(5),
            ..Default::default()
        });
        let (notify, _) = broadcast::channel(1);
        let (scheduler, _driver) =
            DelayQueueReplayScheduler::start(handler.clone(), Shutdown::new(notify.subscribe()));

        scheduler
            .schedule("slow", &key(), Duration::from_secs(1))
            .await
            .unwrap();
        // due at 1s, runs until 6s, due again at 7s
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(handler.calls("slow"), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.calls("slow"), 2);
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_messages_are_not_rescheduled() {
        let handler = Arc::new(CountingHandler {
            gone: Some("acked".to_string()),
            ..Default::default()
        });
        let (notify, _) = broadcast::channel(1);
        let (scheduler, _driver) =
            DelayQueueReplayScheduler::start(handler.clone(), Shutdown::new(notify.subscribe()));

        scheduler
            .schedule("acked", &key(), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.calls("acked"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_during_a_replay_survives_its_completion() {
        let handler = Arc::new(CountingHandler {
            work: Duration::from_secs(3),
            gone: Some("m".to_string()),
            ..Default::default()
        });
        let (notify, _) = broadcast::channel(1);
        let (scheduler, _driver) =
            DelayQueueReplayScheduler::start(handler.clone(), Shutdown::new(notify.subscribe()));

        scheduler.schedule("m", &key(), Duration::from_secs(1)).await.unwrap();
        // first replay runs from 1s to 4s and reports the message gone
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.cancel("m", &key()).await.unwrap();
        scheduler.schedule("m", &key(), Duration::from_secs(5)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handler.calls("m"), 1);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(handler.calls("m"), 2);
    }
}
