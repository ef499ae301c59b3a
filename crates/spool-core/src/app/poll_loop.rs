//! PollLoop - キューごとのポーリングループ
//!
//! # フロー
//! 1. `claim_next` で pending → staging（`claim_timeout` まで待つ）
//! 2. デコード。失敗したら即 dead-letter
//! 3. `attempt_count` を 1 増やして Dispatcher に渡す
//! 4. RetryPolicy が Action を決める
//! 5. acknowledge / restage / dead_letter でストアに反映
//!
//! shutdown は claim と claim の間でだけ見る。claim 済みのタスクは必ず
//! 解決してからループを抜ける。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use super::dispatcher::Dispatcher;
use crate::domain::{Action, Envelope, LoopError, RetryPolicy, StoreError};
use crate::ports::{Claimed, Lease, QueueStore};

/// Upper bound for one sleep between store retries.
const STORE_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// What a loop did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub claimed: u64,
    pub acknowledged: u64,
    pub restaged: u64,
    pub dead_lettered: u64,
}

/// Local retry budget for store calls. Only `Unavailable` is retried.
#[derive(Debug, Clone)]
pub(crate) struct StoreRetry {
    backoff: RetryPolicy,
}

impl StoreRetry {
    pub(crate) fn new(attempts: u32, base: Duration) -> Self {
        Self {
            backoff: RetryPolicy::new(attempts, base, STORE_RETRY_MAX_DELAY.max(base)),
        }
    }

    pub(crate) async fn run<T, F, Fut>(
        &self,
        queue: &str,
        op: &'static str,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_unavailable() && attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.next_delay(attempt);
                    tracing::warn!(
                        queue,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct PollLoop {
    queue: String,
    store: Arc<dyn QueueStore>,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    claim_timeout: Duration,
    store_retry: StoreRetry,
}

impl PollLoop {
    pub fn new(
        queue: impl Into<String>,
        store: Arc<dyn QueueStore>,
        dispatcher: Dispatcher,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue: queue.into(),
            store,
            dispatcher,
            policy,
            claim_timeout: Duration::from_secs(1),
            store_retry: StoreRetry::new(5, Duration::from_millis(100)),
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    pub fn with_store_retry(mut self, attempts: u32, base: Duration) -> Self {
        self.store_retry = StoreRetry::new(attempts, base);
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped).
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<LoopStats, LoopError> {
        let mut stats = LoopStats::default();
        tracing::info!(queue = %self.queue, "poll loop started");

        let store = &self.store;
        let queue = self.queue.as_str();
        let timeout = self.claim_timeout;

        loop {
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            let claimed = self
                .store_retry
                .run(queue, "claim_next", move || store.claim_next(queue, timeout))
                .await?;
            let Some(claimed) = claimed else {
                continue;
            };

            stats.claimed += 1;
            self.process(claimed, &mut stats).await?;
        }

        tracing::info!(queue = %self.queue, ?stats, "poll loop stopped");
        Ok(stats)
    }

    async fn process(&self, claimed: Claimed, stats: &mut LoopStats) -> Result<(), LoopError> {
        let Claimed { lease, envelope } = claimed;

        let mut envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) => {
                let reason = format!("decode error: {err}");
                self.dead_letter(&lease, None, &reason).await?;
                stats.dead_lettered += 1;
                tracing::error!(
                    queue = %self.queue,
                    reason = %reason,
                    "undecodable task dead-lettered"
                );
                return Ok(());
            }
        };

        envelope.attempt_count = envelope.attempt_count.saturating_add(1);
        tracing::debug!(
            task_id = %envelope.id,
            queue = %self.queue,
            attempt = envelope.attempt_count,
            "dispatching task"
        );

        let outcome = self.dispatcher.dispatch(&envelope).await;

        match self.policy.decide(&envelope, &outcome) {
            Action::Acknowledge => {
                self.acknowledge(&lease).await?;
                stats.acknowledged += 1;
                tracing::info!(
                    task_id = %envelope.id,
                    queue = %self.queue,
                    attempt = envelope.attempt_count,
                    reason = outcome.kind(),
                    "task acknowledged"
                );
            }
            Action::Restage(delay) => {
                self.restage(&lease, &envelope, delay).await?;
                stats.restaged += 1;
                tracing::warn!(
                    task_id = %envelope.id,
                    queue = %self.queue,
                    attempt = envelope.attempt_count,
                    reason = outcome.reason().unwrap_or_default(),
                    delay_ms = delay.as_millis() as u64,
                    "task restaged for retry"
                );
            }
            Action::DeadLetter(reason) => {
                self.dead_letter(&lease, Some(&envelope), &reason).await?;
                stats.dead_lettered += 1;
                tracing::error!(
                    task_id = %envelope.id,
                    queue = %self.queue,
                    attempt = envelope.attempt_count,
                    reason = %reason,
                    last_error = outcome.reason().unwrap_or_default(),
                    "task dead-lettered"
                );
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, lease: &Lease) -> Result<(), StoreError> {
        let store = &self.store;
        self.store_retry
            .run(&self.queue, "acknowledge", move || store.acknowledge(lease))
            .await
    }

    async fn restage(
        &self,
        lease: &Lease,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let store = &self.store;
        self.store_retry
            .run(&self.queue, "restage_for_retry", move || {
                store.restage_for_retry(lease, envelope, delay)
            })
            .await
    }

    async fn dead_letter(
        &self,
        lease: &Lease,
        envelope: Option<&Envelope>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let store = &self.store;
        self.store_retry
            .run(&self.queue, "dead_letter", move || {
                store.dead_letter(lease, envelope, reason)
            })
            .await
    }
}
