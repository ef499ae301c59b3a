//! ReaperLoop - 放置された staging エントリの回収
//!
//! A worker that dies mid-task leaves its entry staged. The reaper
//! periodically returns entries staged longer than `stale_after` to the
//! pending tail. Failures are logged and retried on the next tick; they never
//! stop the worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::ports::QueueStore;

pub struct ReaperLoop {
    store: Arc<dyn QueueStore>,
    queues: Vec<String>,
    stale_after: Duration,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(
        store: Arc<dyn QueueStore>,
        queues: Vec<String>,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queues,
            stale_after,
            interval,
        }
    }

    /// One pass over every queue. Returns how many entries went back to pending.
    pub async fn reap_once(&self) -> usize {
        let mut total = 0;
        for queue in &self.queues {
            match self.store.recover_stale(queue, self.stale_after).await {
                Ok(0) => {}
                Ok(recovered) => {
                    tracing::warn!(queue = %queue, recovered, "returned stale staged tasks to pending");
                    total += recovered;
                }
                Err(err) => {
                    tracing::warn!(queue = %queue, error = %err, "stale task recovery failed");
                }
            }
        }
        total
    }

    /// Reap every `interval` until shutdown. The first pass happens one
    /// interval after start. Returns the total recovered.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut total = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    total += self.reap_once().await;
                }
            }
        }
        total
    }
}
