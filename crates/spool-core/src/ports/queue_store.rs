//! QueueStore port - ブローカーとの境界
//!
//! The store owns every location transition of a task:
//!
//! ```text
//! submit ──► pending ──claim_next──► staging ──acknowledge──► (gone)
//!              ▲  ▲                    │  │
//!              │  └──restage(0)────────┘  └──dead_letter──► dead
//!              └──delayed◄──restage(d)──┘
//! ```
//!
//! # 設計原則
//! - 1 インスタンスを全ポーリングループで共有する（`Arc<dyn QueueStore>`）
//! - pending → staging の移動はブローカーのアトミック操作に任せる
//! - 解決系の操作（acknowledge / restage / dead_letter）は lease が staging に
//!   残っているときだけ効く。再試行しても二重にはならない

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DecodeError, EncodeError, Envelope, Payload, StoreError, TaskId};

/// Staging location suffix.
pub const PROCESSING_SUFFIX: &str = ":processing";
pub const CLAIMS_SUFFIX: &str = ":processing:claims";
pub const DELAYED_SUFFIX: &str = ":delayed";
pub const DEAD_SUFFIX: &str = ":dead";

/// Check a logical queue name.
///
/// Names must be non-empty and free of `:` and whitespace, which keeps the
/// derived location names in [`QueueKeys`] collision-free.
pub fn validate_queue_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
        return Err(StoreError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

/// Broker location names derived from a logical queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub pending: String,
    pub processing: String,
    pub claims: String,
    pub delayed: String,
    pub dead: String,
}

impl QueueKeys {
    pub fn new(queue: &str) -> Self {
        Self::with_prefix("", queue)
    }

    /// Same as [`QueueKeys::new`] with a namespace prefix in front of every key.
    pub fn with_prefix(prefix: &str, queue: &str) -> Self {
        let pending = format!("{prefix}{queue}");
        Self {
            processing: format!("{pending}{PROCESSING_SUFFIX}"),
            claims: format!("{pending}{CLAIMS_SUFFIX}"),
            delayed: format!("{pending}{DELAYED_SUFFIX}"),
            dead: format!("{pending}{DEAD_SUFFIX}"),
            pending,
        }
    }
}

/// Proof of a claim: identifies the exact staged entry handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    queue: String,
    receipt: String,
    staged_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(queue: impl Into<String>, receipt: impl Into<String>, staged_at: DateTime<Utc>) -> Self {
        Self {
            queue: queue.into(),
            receipt: receipt.into(),
            staged_at,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The staged entry exactly as the broker holds it.
    pub fn receipt(&self) -> &str {
        &self.receipt
    }

    pub fn staged_at(&self) -> DateTime<Utc> {
        self.staged_at
    }
}

/// A staged entry plus its decode result.
#[derive(Debug)]
pub struct Claimed {
    pub lease: Lease,
    pub envelope: Result<Envelope, DecodeError>,
}

impl Claimed {
    /// Decode the staged entry, stamping `staged_at` and filling a missing
    /// queue name from the lease.
    pub fn from_lease(lease: Lease) -> Self {
        let envelope = Envelope::decode(lease.receipt()).map(|mut env| {
            env.staged_at = Some(lease.staged_at());
            if env.queue_name.is_empty() {
                env.queue_name = lease.queue().to_string();
            }
            env
        });
        Self { lease, envelope }
    }
}

/// A task that could not be processed, kept for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub queue_name: String,

    /// The envelope as of the failing dispatch, or the staged entry verbatim
    /// when it could not be decoded.
    pub raw: String,

    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn envelope(&self) -> Result<Envelope, DecodeError> {
        Envelope::decode(&self.raw)
    }
}

/// Per-queue counts by location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub pending: usize,
    pub staged: usize,
    pub delayed: usize,
    pub dead: usize,
}

impl QueueDepths {
    /// Nothing left to do: no pending, staged or delayed entries.
    pub fn is_quiescent(&self) -> bool {
        self.pending == 0 && self.staged == 0 && self.delayed == 0
    }
}

/// Wire form of an envelope going back to pending: no longer staged.
pub(crate) fn requeue_entry(envelope: &Envelope) -> Result<String, EncodeError> {
    let mut requeued = envelope.clone();
    requeued.staged_at = None;
    requeued.encode()
}

/// Body of a dead-letter record: the resolved envelope when there is one,
/// otherwise the staged entry untouched.
pub(crate) fn dead_entry(lease: &Lease, envelope: Option<&Envelope>) -> Result<String, EncodeError> {
    match envelope {
        Some(envelope) => requeue_entry(envelope),
        None => Ok(lease.receipt().to_string()),
    }
}

/// Claims made at or before the returned instant count as stale.
pub(crate) fn stale_cutoff(now: DateTime<Utc>, older_than: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Boundary to the external broker.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Wait up to `timeout` for a pending task and atomically move it to
    /// staging. `Ok(None)` is the normal idle result.
    async fn claim_next(&self, queue: &str, timeout: Duration)
    -> Result<Option<Claimed>, StoreError>;

    /// Remove the staged entry for good. Acknowledging twice is a no-op.
    async fn acknowledge(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Replace the staged entry with `envelope` at the pending tail, right
    /// away or once `delay` has passed.
    async fn restage_for_retry(
        &self,
        lease: &Lease,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), StoreError>;

    /// Remove the staged entry and record it as dead with `reason`.
    ///
    /// The record carries `envelope` (attempt count included) when given;
    /// `None` keeps the staged entry as is, e.g. for undecodable entries.
    async fn dead_letter(
        &self,
        lease: &Lease,
        envelope: Option<&Envelope>,
        reason: &str,
    ) -> Result<(), StoreError>;

    /// Append a new task to the pending tail. Generates an id when `id` is `None`.
    async fn submit(
        &self,
        queue: &str,
        payload: Payload,
        id: Option<TaskId>,
    ) -> Result<TaskId, StoreError>;

    /// Return staged entries claimed longer than `older_than` ago to the
    /// pending tail. Returns how many were moved.
    async fn recover_stale(&self, queue: &str, older_than: Duration) -> Result<usize, StoreError>;

    async fn depths(&self, queue: &str) -> Result<QueueDepths, StoreError>;

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_are_derived_from_queue_name() {
        let keys = QueueKeys::new("billing");
        assert_eq!(keys.pending, "billing");
        assert_eq!(keys.processing, "billing:processing");
        assert_eq!(keys.claims, "billing:processing:claims");
        assert_eq!(keys.delayed, "billing:delayed");
        assert_eq!(keys.dead, "billing:dead");

        let prefixed = QueueKeys::with_prefix("spool:", "billing");
        assert_eq!(prefixed.processing, "spool:billing:processing");
    }

    #[test]
    fn distinct_valid_names_never_share_keys() {
        let names = ["a", "b", "a_processing", "billing", "billing-dead"];
        let mut all = Vec::new();
        for name in names {
            validate_queue_name(name).unwrap();
            let k = QueueKeys::new(name);
            all.extend([k.pending, k.processing, k.claims, k.delayed, k.dead]);
        }
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), before);
    }

    #[test]
    fn rejects_ambiguous_queue_names() {
        for bad in ["", "billing:processing", "two words", "tab\tname"] {
            assert!(matches!(
                validate_queue_name(bad),
                Err(StoreError::InvalidQueueName(_))
            ));
        }
    }

    #[test]
    fn claimed_fills_in_lease_metadata() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let lease = Lease::new("billing", r#"{"id":"t1","payload":{}}"#, at);
        let claimed = Claimed::from_lease(lease);
        let env = claimed.envelope.unwrap();
        assert_eq!(env.queue_name, "billing");
        assert_eq!(env.staged_at, Some(at));
    }

    #[test]
    fn claimed_keeps_decode_errors() {
        let lease = Lease::new("billing", "{oops", Utc::now());
        let claimed = Claimed::from_lease(lease);
        assert!(matches!(claimed.envelope, Err(DecodeError::Malformed(_))));
        assert_eq!(claimed.lease.receipt(), "{oops");
    }

    #[test]
    fn dead_entry_prefers_the_resolved_envelope() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let lease = Lease::new("billing", r#"{"id":"t2","payload":{},"attempt_count":2}"#, at);
        let mut env = Claimed::from_lease(lease.clone()).envelope.unwrap();
        env.attempt_count = 3;

        let body = dead_entry(&lease, Some(&env)).unwrap();
        let recorded = Envelope::decode(&body).unwrap();
        assert_eq!(recorded.attempt_count, 3);
        assert_eq!(recorded.staged_at, None);

        assert_eq!(dead_entry(&lease, None).unwrap(), lease.receipt());
    }
}
