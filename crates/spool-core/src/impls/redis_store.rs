//! Redis-backed queue store.
//!
//! Layout per logical queue `q` (see [`QueueKeys`]):
//!
//! - `q`: pending list. Producers `RPUSH`, workers `BLMOVE ... LEFT RIGHT`.
//! - `q:processing`: staging list, one entry per claimed task.
//! - `q:processing:claims`: hash `entry -> claimed-at (ms)`, used to find stale claims.
//! - `q:delayed`: sorted set of delayed retries scored by ready-at (ms).
//!   Members are `<ulid>|<entry>` so identical entries never collapse.
//! - `q:dead`: list of JSON [`DeadLetter`] records.
//!
//! The pending → staging move is a single `BLMOVE`. Every resolution is a Lua
//! script or a `MULTI/EXEC` pipeline, and only takes effect while the entry is
//! still staged, so retrying a resolution after a dropped reply is safe.
//!
//! Blocking claims run on a dedicated connection per queue: a `BLMOVE` parked
//! on one queue must not hold up commands for another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::domain::{Envelope, Payload, StoreError, TaskId};
use crate::ports::queue_store::{dead_entry, requeue_entry, stale_cutoff};
use crate::ports::{
    Claimed, Clock, DeadLetter, IdGenerator, Lease, QueueDepths, QueueKeys, QueueStore,
    SystemClock, UlidGenerator, validate_queue_name,
};

/// Smallest block the claim asks Redis for; `0` would mean "forever".
const MIN_BLOCK_SECS: f64 = 0.01;

/// Delayed entries promoted per claim attempt.
const PROMOTE_BATCH: usize = 100;

/// KEYS: delayed, pending. ARGV: now_ms, limit.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  local sep = string.find(member, '|', 1, true)
  redis.call('RPUSH', KEYS[2], string.sub(member, sep + 1))
end
return #due
"#;

/// KEYS: processing, claims, pending, delayed.
/// ARGV: receipt, entry, ready_at_ms (0 = now), delayed member.
const RESTAGE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
if tonumber(ARGV[3]) > 0 then
  redis.call('ZADD', KEYS[4], ARGV[3], ARGV[4])
else
  redis.call('RPUSH', KEYS[3], ARGV[2])
end
return 1
"#;

/// KEYS: processing, claims, dead. ARGV: receipt, record.
const DEAD_LETTER_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[2])
return 1
"#;

/// KEYS: processing, claims, pending. ARGV: cutoff_ms, now_ms.
///
/// Entries without a claim timestamp (worker died between BLMOVE and HSET)
/// get one now, so they are reclaimed on a later pass.
const RECOVER_SCRIPT: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
local moved = 0
for _, entry in ipairs(entries) do
  local claimed_at = redis.call('HGET', KEYS[2], entry)
  if not claimed_at then
    redis.call('HSET', KEYS[2], entry, ARGV[2])
  elseif tonumber(claimed_at) <= tonumber(ARGV[1]) then
    if redis.call('LREM', KEYS[1], 1, entry) > 0 then
      redis.call('HDEL', KEYS[2], entry)
      redis.call('RPUSH', KEYS[3], entry)
      moved = moved + 1
    end
  end
end
return moved
"#;

/// Score for a delayed entry; saturates instead of wrapping on huge delays.
fn ready_at_ms(now_ms: i64, delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).map_or(i64::MAX, |ms| now_ms.saturating_add(ms))
}

fn map_redis_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

/// [`QueueStore`] on top of Redis lists, a hash and a sorted set.
pub struct RedisStore {
    client: redis::Client,
    shared: ConnectionManager,
    blocking: Mutex<HashMap<String, ConnectionManager>>,
    prefix: String,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    promote: redis::Script,
    restage: redis::Script,
    dead_letter: redis::Script,
    recover: redis::Script,
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let shared = ConnectionManager::new(client.clone())
            .await
            .map_err(map_redis_error)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        tracing::info!(redis_url, "connected to redis");

        Ok(Self {
            client,
            shared,
            blocking: Mutex::new(HashMap::new()),
            prefix: String::new(),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            promote: redis::Script::new(PROMOTE_SCRIPT),
            restage: redis::Script::new(RESTAGE_SCRIPT),
            dead_letter: redis::Script::new(DEAD_LETTER_SCRIPT),
            recover: redis::Script::new(RECOVER_SCRIPT),
        })
    }

    /// Namespace every key, e.g. `"spool:"` turns `billing` into `spool:billing`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::with_prefix(&self.prefix, queue)
    }

    async fn blocking_connection(&self, queue: &str) -> Result<ConnectionManager, StoreError> {
        let mut conns = self.blocking.lock().await;
        if let Some(conn) = conns.get(queue) {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(map_redis_error)?;
        conns.insert(queue.to_string(), conn.clone());
        Ok(conn)
    }

    /// Staged bytes that are not UTF-8 cannot become a lease; park them in
    /// the dead-letter list straight away.
    async fn dead_letter_bytes(&self, keys: &QueueKeys, queue: &str, raw: Vec<u8>) -> Result<(), StoreError> {
        let record = DeadLetter {
            queue_name: queue.to_string(),
            raw: String::from_utf8_lossy(&raw).into_owned(),
            reason: "decode error: entry is not valid UTF-8".to_string(),
            failed_at: self.clock.now(),
        };
        let record = serde_json::to_string(&record)
            .map_err(|e| StoreError::Backend(format!("dead letter encode: {e}")))?;

        let mut conn = self.shared.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM").arg(&keys.processing).arg(1).arg(raw).ignore()
            .cmd("RPUSH").arg(&keys.dead).arg(record).ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)?;

        tracing::error!(queue, "dead-lettered non UTF-8 entry");
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn claim_next(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Claimed>, StoreError> {
        validate_queue_name(queue)?;
        let keys = self.keys(queue);
        let mut shared = self.shared.clone();

        let promoted: usize = self
            .promote
            .key(&keys.delayed)
            .key(&keys.pending)
            .arg(self.clock.now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut shared)
            .await
            .map_err(map_redis_error)?;
        if promoted > 0 {
            tracing::debug!(queue, promoted, "promoted delayed retries");
        }

        let mut blocking = self.blocking_connection(queue).await?;
        let raw: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&keys.pending)
            .arg(&keys.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64().max(MIN_BLOCK_SECS))
            .query_async(&mut blocking)
            .await
            .map_err(map_redis_error)?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let raw = match String::from_utf8(raw) {
            Ok(raw) => raw,
            Err(e) => {
                self.dead_letter_bytes(&keys, queue, e.into_bytes()).await?;
                return Ok(None);
            }
        };

        let staged_at = self.clock.now();
        let stamped = redis::cmd("HSET")
            .arg(&keys.claims)
            .arg(&raw)
            .arg(staged_at.timestamp_millis())
            .query_async::<_, ()>(&mut shared)
            .await;
        if let Err(e) = stamped {
            // The entry is ours either way; recovery stamps it on its next pass.
            tracing::warn!(queue, error = %e, "failed to record claim time");
        }

        Ok(Some(Claimed::from_lease(Lease::new(queue, raw, staged_at))))
    }

    async fn acknowledge(&self, lease: &Lease) -> Result<(), StoreError> {
        let keys = self.keys(lease.queue());
        let mut conn = self.shared.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM").arg(&keys.processing).arg(1).arg(lease.receipt()).ignore()
            .cmd("HDEL").arg(&keys.claims).arg(lease.receipt()).ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn restage_for_retry(
        &self,
        lease: &Lease,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let keys = self.keys(lease.queue());
        let entry = requeue_entry(envelope)?;
        let ready_at_ms = if delay.is_zero() {
            0
        } else {
            ready_at_ms(self.clock.now().timestamp_millis(), delay)
        };
        let member = format!("{}|{}", Ulid::new(), entry);

        let mut conn = self.shared.clone();
        let moved: i64 = self
            .restage
            .key(&keys.processing)
            .key(&keys.claims)
            .key(&keys.pending)
            .key(&keys.delayed)
            .arg(lease.receipt())
            .arg(&entry)
            .arg(ready_at_ms)
            .arg(&member)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if moved == 0 {
            tracing::warn!(
                queue = lease.queue(),
                task_id = %envelope.id,
                "restage skipped: entry is no longer staged"
            );
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        lease: &Lease,
        envelope: Option<&Envelope>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let keys = self.keys(lease.queue());
        let record = DeadLetter {
            queue_name: lease.queue().to_string(),
            raw: dead_entry(lease, envelope)?,
            reason: reason.to_string(),
            failed_at: self.clock.now(),
        };
        let record = serde_json::to_string(&record)
            .map_err(|e| StoreError::Backend(format!("dead letter encode: {e}")))?;

        let mut conn = self.shared.clone();
        let moved: i64 = self
            .dead_letter
            .key(&keys.processing)
            .key(&keys.claims)
            .key(&keys.dead)
            .arg(lease.receipt())
            .arg(record)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if moved == 0 {
            tracing::warn!(
                queue = lease.queue(),
                "dead-letter skipped: entry is no longer staged"
            );
        }
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
        let entry = Envelope::new(id.clone(), queue, payload)
            .with_enqueued_at(self.clock.now())
            .encode()?;

        let mut conn = self.shared.clone();
        redis::cmd("RPUSH")
            .arg(&self.keys(queue).pending)
            .arg(entry)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(id)
    }

    async fn recover_stale(&self, queue: &str, older_than: Duration) -> Result<usize, StoreError> {
        let keys = self.keys(queue);
        let now = self.clock.now();
        let cutoff = stale_cutoff(now, older_than);

        let mut conn = self.shared.clone();
        self.recover
            .key(&keys.processing)
            .key(&keys.claims)
            .key(&keys.pending)
            .arg(cutoff.timestamp_millis())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn depths(&self, queue: &str) -> Result<QueueDepths, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.shared.clone();
        let (pending, staged, delayed, dead): (usize, usize, usize, usize) = redis::pipe()
            .cmd("LLEN").arg(&keys.pending)
            .cmd("LLEN").arg(&keys.processing)
            .cmd("ZCARD").arg(&keys.delayed)
            .cmd("LLEN").arg(&keys.dead)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(QueueDepths {
            pending,
            staged,
            delayed,
            dead,
        })
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.shared.clone();
        let records: Vec<String> = redis::cmd("LRANGE")
            .arg(&keys.dead)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(records
            .iter()
            .filter_map(|record| match serde_json::from_str(record) {
                Ok(letter) => Some(letter),
                Err(e) => {
                    tracing::warn!(queue, error = %e, "skipping unreadable dead letter record");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_count_as_unavailable() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(map_redis_error(io).is_unavailable());

        let wrong_type = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(map_redis_error(wrong_type), StoreError::Backend(_)));
    }

    #[test]
    fn huge_delays_saturate_instead_of_wrapping() {
        let now = 1_700_000_000_000;
        assert_eq!(ready_at_ms(now, Duration::from_millis(250)), now + 250);
        assert_eq!(ready_at_ms(now, Duration::from_millis(u64::MAX)), i64::MAX);
        assert_eq!(ready_at_ms(now, Duration::MAX), i64::MAX);
    }
}
