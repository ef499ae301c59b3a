//! Lifecycle controller - ループの起動・停止・致命的エラーの集約
//!
//! - 起動: `stale_after` があれば各キューで `recover_stale` を 1 回、その後キューごとに
//!   PollLoop を 1 タスクずつ spawn する
//! - 停止: watch チャネルで shutdown を配り、全ループの終了を待つ
//! - どれか 1 つのループが致命的エラーで止まったら、残りにも shutdown を配って
//!   全部止まるのを待ち、失敗したキューを全部まとめて返す

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::{Id, JoinHandle, JoinSet};

use super::builder::{Worker, WorkerBuilder};
use super::config::WorkerConfig;
use super::dispatcher::{Dispatcher, panic_message};
use super::poll_loop::{LoopStats, PollLoop, StoreRetry};
use super::reaper_loop::ReaperLoop;
use super::status::WorkerReport;
use crate::domain::{LoopError, QueueFailure, WorkerError};
use crate::ports::QueueStore;
use crate::typed::TaskHandler;

/// Requests shutdown of a running worker. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Loops finish their current task and stop before the next claim.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A started worker.
pub struct WorkerHandle {
    shutdown: ShutdownTrigger,
    loops: JoinSet<Result<LoopStats, LoopError>>,
    queue_by_task: HashMap<Id, String>,
    reaper: Option<JoinHandle<usize>>,
    recovered_on_startup: usize,
}

impl Worker {
    /// Recover stale entries (when configured) and spawn one loop per queue.
    pub async fn start(self) -> Result<WorkerHandle, WorkerError> {
        let Worker {
            store,
            config,
            registry,
        } = self;

        let recovered_on_startup = match config.stale_after {
            Some(stale_after) => {
                recover_on_startup(&store, &config, &registry.queue_names(), stale_after).await?
            }
            None => 0,
        };

        let (tx, rx) = watch::channel(false);
        let permits = config.max_concurrent_handlers.map(|n| Arc::new(Semaphore::new(n)));
        let policy = config.retry_policy();

        let mut loops = JoinSet::new();
        let mut queue_by_task = HashMap::new();
        for (queue, handler) in registry.iter() {
            let dispatcher = Dispatcher::new(Arc::clone(handler))
                .with_timeout(config.handler_timeout)
                .with_permits(permits.clone());
            let poll = PollLoop::new(queue.clone(), Arc::clone(&store), dispatcher, policy.clone())
                .with_claim_timeout(config.claim_timeout)
                .with_store_retry(config.store_retry_attempts, config.store_retry_base);

            let abort = loops.spawn(poll.run(rx.clone()));
            queue_by_task.insert(abort.id(), queue.clone());
        }

        let reaper = match (config.stale_after, config.reap_interval) {
            (Some(stale_after), Some(interval)) => {
                let reaper = ReaperLoop::new(
                    Arc::clone(&store),
                    registry.queue_names(),
                    stale_after,
                    interval,
                );
                Some(tokio::spawn(reaper.run(rx.clone())))
            }
            _ => None,
        };

        tracing::info!(
            queues = ?registry.queue_names(),
            recovered_on_startup,
            reaper = reaper.is_some(),
            "worker started"
        );

        Ok(WorkerHandle {
            shutdown: ShutdownTrigger { tx: Arc::new(tx) },
            loops,
            queue_by_task,
            reaper,
            recovered_on_startup,
        })
    }

    /// Start, run until `signal` resolves (or a loop fails), then shut down.
    pub async fn run_until<F>(self, signal: F) -> Result<WorkerReport, WorkerError>
    where
        F: Future<Output = ()>,
    {
        let handle = self.start().await?;
        let trigger = handle.shutdown_trigger();
        let wait = handle.wait();
        tokio::pin!(wait);

        tokio::select! {
            result = &mut wait => return result,
            _ = signal => {
                tracing::info!("shutdown requested");
                trigger.trigger();
            }
        }
        wait.await
    }
}

async fn recover_on_startup(
    store: &Arc<dyn QueueStore>,
    config: &WorkerConfig,
    queues: &[String],
    stale_after: std::time::Duration,
) -> Result<usize, WorkerError> {
    let retry = StoreRetry::new(config.store_retry_attempts, config.store_retry_base);
    let mut total = 0;
    for queue in queues {
        let recovered = retry
            .run(queue, "recover_stale", move || store.recover_stale(queue, stale_after))
            .await
            .map_err(|source| WorkerError::Startup {
                queue: queue.clone(),
                source,
            })?;
        if recovered > 0 {
            tracing::warn!(queue = %queue, recovered, "returned stale staged tasks to pending");
        }
        total += recovered;
    }
    Ok(total)
}

impl WorkerHandle {
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for every loop to stop.
    ///
    /// The first loop failure triggers shutdown for the rest. All failures are
    /// returned together in [`WorkerError::Fatal`].
    pub async fn wait(mut self) -> Result<WorkerReport, WorkerError> {
        let mut failures = Vec::new();
        let mut stats = BTreeMap::new();

        while let Some(joined) = self.loops.join_next_with_id().await {
            let (queue, result) = match joined {
                Ok((id, result)) => (self.queue_name(id), result),
                Err(err) => {
                    let queue = self.queue_name(err.id());
                    let message = if err.is_panic() {
                        panic_message(err.into_panic())
                    } else {
                        err.to_string()
                    };
                    (queue, Err(LoopError::Panicked(message)))
                }
            };

            match result {
                Ok(loop_stats) => {
                    stats.insert(queue, loop_stats);
                }
                Err(error) => {
                    if failures.is_empty() {
                        tracing::error!(queue = %queue, error = %error, "poll loop failed, stopping worker");
                    } else {
                        tracing::error!(queue = %queue, error = %error, "poll loop failed");
                    }
                    self.shutdown.trigger();
                    failures.push(QueueFailure { queue, error });
                }
            }
        }

        self.shutdown.trigger();
        let reaped = match self.reaper.take() {
            Some(reaper) => reaper.await.unwrap_or_else(|err| {
                tracing::warn!(error = %err, "reaper task ended abnormally");
                0
            }),
            None => 0,
        };

        if !failures.is_empty() {
            return Err(WorkerError::Fatal(failures));
        }

        let report = WorkerReport {
            loops: stats,
            recovered_on_startup: self.recovered_on_startup,
            reaped,
        };
        tracing::info!(totals = ?report.totals(), "worker stopped");
        Ok(report)
    }

    /// [`WorkerHandle::request_shutdown`] then [`WorkerHandle::wait`].
    pub async fn shutdown_and_wait(self) -> Result<WorkerReport, WorkerError> {
        self.request_shutdown();
        self.wait().await
    }

    fn queue_name(&self, id: Id) -> String {
        self.queue_by_task
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("task-{id}"))
    }
}

/// Run `handler` on every queue in `config.queue_names` until `shutdown` resolves.
pub async fn run<F>(
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    shutdown: F,
) -> Result<WorkerReport, WorkerError>
where
    F: Future<Output = ()>,
{
    let mut builder = WorkerBuilder::new(store).config(config.clone());
    for queue in &config.queue_names {
        builder = builder
            .queue(queue.clone(), Arc::clone(&handler))
            .map_err(|e| WorkerError::Build(e.into()))?;
    }
    builder.build()?.run_until(shutdown).await
}
