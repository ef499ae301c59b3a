//! InMemoryStore - 開発・テスト用のキューストア
//!
//! # 実装詳細
//! - キューごとに pending(VecDeque) / staged(Vec) / delayed(BinaryHeap) / dead(Vec)
//! - tokio の Mutex で排他制御（ロックを跨いで await しない）
//! - キューごとの Notify で submit / restage 時に待機中の claim を起こす
//! - `set_offline` でブローカー障害を再現できる

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{Envelope, Payload, StoreError, TaskId};
use crate::ports::queue_store::{dead_entry, requeue_entry, stale_cutoff};
use crate::ports::{
    Claimed, Clock, DeadLetter, IdGenerator, Lease, QueueDepths, QueueStore, SystemClock,
    UlidGenerator, validate_queue_name,
};

/// Stand-in for "never" when `now + d` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d).unwrap_or(now + FAR_FUTURE)
}

/// Delayed retry entry.
///
/// We use reverse ordering so BinaryHeap acts as a min-heap (earliest first);
/// `seq` keeps equal deadlines in restage order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delayed {
    ready_at: Instant,
    seq: u64,
    raw: String,
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone)]
struct Staged {
    receipt: String,
    staged_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    staged: Vec<Staged>,
    delayed: BinaryHeap<Delayed>,
    dead: Vec<DeadLetter>,
    acknowledged: Vec<String>,
    notify: Arc<Notify>,
}

impl QueueState {
    /// Move due delayed entries to the pending tail.
    fn promote_delayed(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break; // Heap is sorted, so we can stop
            }
            if let Some(entry) = self.delayed.pop() {
                self.pending.push_back(entry.raw);
            }
        }
    }

    /// Remove one staged entry matching `receipt`. `false` if none is staged.
    fn take_staged(&mut self, receipt: &str) -> bool {
        match self.staged.iter().position(|s| s.receipt == receipt) {
            Some(index) => {
                self.staged.remove(index);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct StoreState {
    queues: HashMap<String, QueueState>,
    offline: HashSet<String>,
    next_seq: u64,
}

impl StoreState {
    fn queue(&mut self, name: &str) -> Result<&mut QueueState, StoreError> {
        if self.offline.contains(name) {
            return Err(StoreError::Unavailable(format!(
                "in-memory queue '{name}' is offline"
            )));
        }
        Ok(self.queues.entry(name.to_string()).or_default())
    }
}

/// In-memory [`QueueStore`].
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for `enqueued_at` / `staged_at` and stale-claim checks.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Push a wire entry as-is, for producers that build their own envelopes.
    pub async fn submit_raw(&self, queue: &str, raw: impl Into<String>) -> Result<(), StoreError> {
        validate_queue_name(queue)?;
        let mut state = self.state.lock().await;
        let q = state.queue(queue)?;
        q.pending.push_back(raw.into());
        q.notify.notify_one();
        Ok(())
    }

    /// Simulate a broker outage for one queue.
    pub async fn set_offline(&self, queue: &str, offline: bool) {
        let mut state = self.state.lock().await;
        if offline {
            state.offline.insert(queue.to_string());
        } else {
            state.offline.remove(queue);
        }
    }

    /// Ids of every acknowledged task, in acknowledgement order.
    pub async fn acknowledged(&self, queue: &str) -> Vec<TaskId> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| {
                q.acknowledged
                    .iter()
                    .filter_map(|raw| Envelope::decode(raw).ok().map(|env| env.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of the pending entries, head first.
    pub async fn pending(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.pending.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn claim_next(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Claimed>, StoreError> {
        validate_queue_name(queue)?;
        let deadline = deadline_after(timeout);
        loop {
            let (notify, next_wake) = {
                let mut state = self.state.lock().await;
                let staged_at = self.clock.now();
                let q = state.queue(queue)?;
                q.promote_delayed(Instant::now());

                if let Some(raw) = q.pending.pop_front() {
                    q.staged.push(Staged {
                        receipt: raw.clone(),
                        staged_at,
                    });
                    let lease = Lease::new(queue, raw, staged_at);
                    return Ok(Some(Claimed::from_lease(lease)));
                }

                (
                    Arc::clone(&q.notify),
                    q.delayed.peek().map(|entry| entry.ready_at),
                )
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Wait for a submit/restage OR the next delayed task OR the deadline
            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notify.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn acknowledge(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let q = state.queue(lease.queue())?;
        if q.take_staged(lease.receipt()) {
            q.acknowledged.push(lease.receipt().to_string());
        }
        Ok(())
    }

    async fn restage_for_retry(
        &self,
        lease: &Lease,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let raw = requeue_entry(envelope)?;
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let seq = state.next_seq;
        let q = state.queue(lease.queue())?;

        if !q.take_staged(lease.receipt()) {
            tracing::warn!(
                queue = lease.queue(),
                task_id = %envelope.id,
                "restage skipped: entry is no longer staged"
            );
            return Ok(());
        }

        if delay.is_zero() {
            q.pending.push_back(raw);
        } else {
            q.delayed.push(Delayed {
                ready_at: deadline_after(delay),
                seq,
                raw,
            });
        }
        q.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(
        &self,
        lease: &Lease,
        envelope: Option<&Envelope>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let raw = dead_entry(lease, envelope)?;
        let failed_at = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue(lease.queue())?;

        if !q.take_staged(lease.receipt()) {
            tracing::warn!(
                queue = lease.queue(),
                "dead-letter skipped: entry is no longer staged"
            );
            return Ok(());
        }

        q.dead.push(DeadLetter {
            queue_name: lease.queue().to_string(),
            raw,
            reason: reason.to_string(),
            failed_at,
        });
        Ok(())
    }

    async fn submit(
        &self,
        queue: &str,
        payload: Payload,
        id: Option<TaskId>,
    ) -> Result<TaskId, StoreError> {
        validate_queue_name(queue)?;
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.ids.generate_task_id());
        let raw = Envelope::new(id.clone(), queue, payload)
            .with_enqueued_at(self.clock.now())
            .encode()?;

        let mut state = self.state.lock().await;
        let q = state.queue(queue)?;
        q.pending.push_back(raw);
        q.notify.notify_one();
        Ok(id)
    }

    async fn recover_stale(&self, queue: &str, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = stale_cutoff(self.clock.now(), older_than);
        let mut state = self.state.lock().await;
        let q = state.queue(queue)?;

        let (stale, fresh): (Vec<_>, Vec<_>) =
            q.staged.drain(..).partition(|s| s.staged_at <= cutoff);
        q.staged = fresh;
        let recovered = stale.len();
        q.pending.extend(stale.into_iter().map(|s| s.receipt));
        if recovered > 0 {
            q.notify.notify_one();
        }
        Ok(recovered)
    }

    async fn depths(&self, queue: &str) -> Result<QueueDepths, StoreError> {
        let mut state = self.state.lock().await;
        let q = state.queue(queue)?;
        Ok(QueueDepths {
            pending: q.pending.len(),
            staged: q.staged.len(),
            delayed: q.delayed.len(),
            dead: q.dead.len(),
        })
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.queue(queue)?.dead.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn claim(store: &InMemoryStore, queue: &str) -> Claimed {
        store
            .claim_next(queue, Duration::from_millis(100))
            .await
            .unwrap()
            .expect("a task should be claimable")
    }

    #[tokio::test]
    async fn submit_then_claim_is_fifo() {
        let store = InMemoryStore::new();
        for n in 0..3 {
            store
                .submit("billing", payload(json!({ "n": n })), Some(TaskId::new(format!("t{n}"))))
                .await
                .unwrap();
        }

        for n in 0..3 {
            let env = claim(&store, "billing").await.envelope.unwrap();
            assert_eq!(env.id.as_str(), format!("t{n}"));
            assert_eq!(env.queue_name, "billing");
            assert!(env.enqueued_at.is_some());
            assert!(env.staged_at.is_some());
        }
        let depths = store.depths("billing").await.unwrap();
        assert_eq!(depths.pending, 0);
        assert_eq!(depths.staged, 3);
    }

    #[tokio::test]
    async fn submit_generates_missing_ids() {
        let store = InMemoryStore::new();
        let id = store.submit("billing", Payload::new(), None).await.unwrap();
        assert!(id.as_str().starts_with("task-"));
        let env = claim(&store, "billing").await.envelope.unwrap();
        assert_eq!(env.id, id);
    }

    #[tokio::test]
    async fn claim_times_out_with_none() {
        let store = InMemoryStore::new();
        let start = Instant::now();
        let claimed = store
            .claim_next("idle", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(claimed.is_none());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn submit_wakes_waiting_claim() {
        let store = Arc::new(InMemoryStore::new());

        let waiter = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.claim_next("billing", Duration::from_secs(5)).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        store
            .submit("billing", Payload::new(), Some("t1".into()))
            .await
            .unwrap();

        let claimed = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.envelope.unwrap().id.as_str(), "t1");
    }

    #[tokio::test]
    async fn queues_do_not_share_tasks() {
        let store = InMemoryStore::new();
        store.submit("a", Payload::new(), Some("ta".into())).await.unwrap();

        let from_b = store.claim_next("b", Duration::from_millis(50)).await.unwrap();
        assert!(from_b.is_none());
        assert_eq!(claim(&store, "a").await.envelope.unwrap().id.as_str(), "ta");
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let store = InMemoryStore::new();
        store.submit("billing", Payload::new(), Some("t1".into())).await.unwrap();
        let claimed = claim(&store, "billing").await;

        store.acknowledge(&claimed.lease).await.unwrap();
        store.acknowledge(&claimed.lease).await.unwrap();

        assert_eq!(store.acknowledged("billing").await, vec![TaskId::new("t1")]);
        assert!(store.depths("billing").await.unwrap().is_quiescent());
    }

    #[tokio::test]
    async fn restage_without_delay_goes_to_tail() {
        let store = InMemoryStore::new();
        store.submit("billing", Payload::new(), Some("t1".into())).await.unwrap();
        store.submit("billing", Payload::new(), Some("t2".into())).await.unwrap();

        let first = claim(&store, "billing").await;
        let mut env = first.envelope.clone().unwrap();
        env.attempt_count = 1;
        store
            .restage_for_retry(&first.lease, &env, Duration::ZERO)
            .await
            .unwrap();

        let next = claim(&store, "billing").await.envelope.unwrap();
        assert_eq!(next.id.as_str(), "t2");
        let retried = claim(&store, "billing").await.envelope.unwrap();
        assert_eq!(retried.id.as_str(), "t1");
        assert_eq!(retried.attempt_count, 1);
    }

    #[tokio::test]
    async fn delayed_restage_becomes_claimable_after_delay() {
        let store = InMemoryStore::new();
        store.submit("billing", Payload::new(), Some("t1".into())).await.unwrap();
        let claimed = claim(&store, "billing").await;
        let env = claimed.envelope.clone().unwrap();

        store
            .restage_for_retry(&claimed.lease, &env, Duration::from_millis(150))
            .await
            .unwrap();
        assert_eq!(store.depths("billing").await.unwrap().delayed, 1);

        let early = store
            .claim_next("billing", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(early.is_none());

        let later = store
            .claim_next("billing", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.envelope.unwrap().id.as_str(), "t1");
    }

    #[tokio::test]
    async fn huge_delay_parks_the_task_instead_of_overflowing() {
        let store = InMemoryStore::new();
        store.submit("billing", Payload::new(), Some("t1".into())).await.unwrap();
        let claimed = claim(&store, "billing").await;
        let env = claimed.envelope.clone().unwrap();

        store
            .restage_for_retry(&claimed.lease, &env, Duration::MAX)
            .await
            .unwrap();

        let next = store
            .claim_next("billing", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(next.is_none());
        assert_eq!(store.depths("billing").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn dead_letter_keeps_raw_entry_and_reason() {
        let store = InMemoryStore::new();
        store.submit_raw("billing", "not-json").await.unwrap();
        let claimed = claim(&store, "billing").await;
        assert!(claimed.envelope.is_err());

        store.dead_letter(&claimed.lease, None, "decode error").await.unwrap();

        let dead = store.dead_letters("billing").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].raw, "not-json");
        assert_eq!(dead[0].reason, "decode error");
        assert!(store.depths("billing").await.unwrap().is_quiescent());
    }

    #[tokio::test]
    async fn resolving_an_unstaged_lease_changes_nothing() {
        let store = InMemoryStore::new();
        store.submit("billing", Payload::new(), Some("t1".into())).await.unwrap();
        let claimed = claim(&store, "billing").await;
        let env = claimed.envelope.clone().unwrap();

        store.restage_for_retry(&claimed.lease, &env, Duration::ZERO).await.unwrap();
        // second resolution of the same lease must not duplicate or drop
        store.restage_for_retry(&claimed.lease, &env, Duration::ZERO).await.unwrap();
        store.dead_letter(&claimed.lease, Some(&env), "late").await.unwrap();

        let depths = store.depths("billing").await.unwrap();
        assert_eq!(depths.pending, 1);
        assert_eq!(depths.dead, 0);
    }

    #[tokio::test]
    async fn recover_stale_returns_old_claims_to_pending() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let store = InMemoryStore::with_clock(clock.clone());

        store.submit("billing", Payload::new(), Some("old".into())).await.unwrap();
        store.submit("billing", Payload::new(), Some("new".into())).await.unwrap();
        claim(&store, "billing").await;
        clock.advance(Duration::from_secs(120));
        claim(&store, "billing").await;

        let recovered = store
            .recover_stale("billing", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let depths = store.depths("billing").await.unwrap();
        assert_eq!(depths.pending, 1);
        assert_eq!(depths.staged, 1);
        let again = claim(&store, "billing").await.envelope.unwrap();
        assert_eq!(again.id.as_str(), "old");
    }

    #[tokio::test]
    async fn offline_queue_reports_unavailable() {
        let store = InMemoryStore::new();
        store.set_offline("billing", true).await;

        let err = store
            .claim_next("billing", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.submit("email", Payload::new(), None).await.is_ok());

        store.set_offline("billing", false).await;
        assert!(store.submit("billing", Payload::new(), None).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_queue_names_are_rejected() {
        let store = InMemoryStore::new();
        let err = store
            .submit("billing:processing", Payload::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQueueName(_)));
    }
}
