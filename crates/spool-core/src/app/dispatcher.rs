//! Dispatcher - ハンドラ呼び出しと結果の捕捉
//!
//! The handler runs in its own tokio task so that a panic stops at this
//! boundary and becomes a retryable outcome instead of tearing down the loop.
//! The dispatcher never retries by itself.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::domain::{Envelope, HandlerError, Outcome};
use crate::typed::TaskHandler;

#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn TaskHandler>,
    timeout: Option<Duration>,
    permits: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            handler,
            timeout: None,
            permits: None,
        }
    }

    /// Abort the handler after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share a concurrency bound with other dispatchers.
    pub fn with_permits(mut self, permits: Option<Arc<Semaphore>>) -> Self {
        self.permits = permits;
        self
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> Outcome {
        // A closed semaphore means nobody bounds us any more.
        let _permit = match &self.permits {
            Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
            None => None,
        };

        let handler = Arc::clone(&self.handler);
        let id = envelope.id.clone();
        let payload = envelope.payload.clone();
        let mut task = tokio::spawn(async move { handler.handle(&id, &payload).await });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    tracing::warn!(
                        task_id = %envelope.id,
                        queue = %envelope.queue_name,
                        attempt = envelope.attempt_count,
                        timeout_ms = limit.as_millis() as u64,
                        "handler timed out"
                    );
                    return Outcome::retryable(format!("handler timed out after {limit:?}"));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(HandlerError::Retryable(reason))) => Outcome::RetryableFailure(reason),
            Ok(Err(HandlerError::Fatal(reason))) => Outcome::FatalFailure(reason),
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                tracing::error!(
                    task_id = %envelope.id,
                    queue = %envelope.queue_name,
                    attempt = envelope.attempt_count,
                    panic = %message,
                    "handler crashed"
                );
                Outcome::retryable(format!("handler panicked: {message}"))
            }
            Err(err) => Outcome::retryable(format!("handler cancelled: {err}")),
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Payload, TaskId};
    use crate::typed::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope() -> Envelope {
        let mut env = Envelope::new(TaskId::new("t1"), "billing", Payload::new());
        env.attempt_count = 1;
        env
    }

    fn dispatcher_returning(result: Result<(), HandlerError>) -> Dispatcher {
        Dispatcher::new(Arc::new(handler_fn(move |_, _| {
            let result = result.clone();
            async move { result }
        })))
    }

    #[tokio::test]
    async fn maps_handler_results_to_outcomes() {
        assert_eq!(dispatcher_returning(Ok(())).dispatch(&envelope()).await, Outcome::Success);
        assert_eq!(
            dispatcher_returning(Err(HandlerError::retryable("busy")))
                .dispatch(&envelope())
                .await,
            Outcome::retryable("busy")
        );
        assert_eq!(
            dispatcher_returning(Err(HandlerError::fatal("bad card")))
                .dispatch(&envelope())
                .await,
            Outcome::fatal("bad card")
        );
    }

    #[tokio::test]
    async fn panic_becomes_retryable_failure() {
        let dispatcher = Dispatcher::new(Arc::new(handler_fn(|_, _| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, HandlerError>(())
        })));

        let outcome = dispatcher.dispatch(&envelope()).await;
        assert_eq!(outcome, Outcome::retryable("handler panicked: kaboom"));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let dispatcher = Dispatcher::new(Arc::new(handler_fn(|_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, HandlerError>(())
        })))
        .with_timeout(Some(Duration::from_millis(20)));

        let outcome = dispatcher.dispatch(&envelope()).await;
        assert!(matches!(outcome, Outcome::RetryableFailure(r) if r.starts_with("handler timed out")));
    }

    #[tokio::test]
    async fn shared_permits_bound_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let handler: Arc<dyn TaskHandler> = Arc::new(handler_fn(move |_, _| {
            let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        }));

        let permits = Some(Arc::new(Semaphore::new(1)));
        let a = Dispatcher::new(Arc::clone(&handler)).with_permits(permits.clone());
        let b = Dispatcher::new(handler).with_permits(permits);

        let env = envelope();
        let (x, y) = tokio::join!(a.dispatch(&env), b.dispatch(&env));
        assert!(x.is_success() && y.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_messages_are_extracted() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
    }
}
