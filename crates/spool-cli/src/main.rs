use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use spool_core::app::queue_status;
use spool_core::impls::InMemoryStore;
use spool_core::typed::submit_task;
use spool_core::{
    Handler, HandlerError, Payload, QueueStore, Task, TaskId, WorkerBuilder, WorkerConfig,
    handler_fn,
};

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl Task for Greet {
    const QUEUE: &'static str = "greetings";
}

/// Fails the first `n` tasks on purpose so the retry path shows up in the logs.
struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<Greet> for GreetHandler {
    async fn handle(&self, id: &TaskId, task: Greet) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::retryable(format!(
                "intentional failure (left={left})"
            )));
        }

        tracing::info!(task_id = %id, "Hello, {}!", task.name);
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(feature = "redis")]
async fn connect_store() -> anyhow::Result<Arc<dyn QueueStore>> {
    match std::env::var("SPOOL_REDIS_URL") {
        Ok(url) => {
            let store = spool_core::impls::RedisStore::connect(&url)
                .await
                .with_context(|| format!("connecting to {url}"))?;
            Ok(Arc::new(store))
        }
        Err(_) => Ok(in_memory_store()),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store() -> anyhow::Result<Arc<dyn QueueStore>> {
    Ok(in_memory_store())
}

fn in_memory_store() -> Arc<dyn QueueStore> {
    tracing::info!("using in-memory store");
    Arc::new(InMemoryStore::new())
}

async fn submit_demo_tasks(store: &dyn QueueStore, queues: &[String]) -> anyhow::Result<()> {
    for name in ["Ada", "Grace", "Linus"] {
        let id = submit_task(store, &Greet { name: name.into() }, None).await?;
        tracing::info!(task_id = %id, queue = Greet::QUEUE, "submitted");
    }

    for queue in queues.iter().filter(|q| q.as_str() != Greet::QUEUE) {
        let mut payload = Payload::new();
        payload.insert("source".into(), "spool-cli demo".into());
        let id = store.submit(queue, payload, None).await?;
        tracing::info!(task_id = %id, queue = %queue, "submitted");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("loading SPOOL_* configuration")?;
    let store = connect_store().await?;

    // Greet gets a typed handler; every other configured queue just logs its tasks.
    let mut builder = WorkerBuilder::new(Arc::clone(&store))
        .config(config.clone())
        .register::<Greet, _>(GreetHandler::new(2))?;
    for queue in config.queue_names.iter().filter(|q| q.as_str() != Greet::QUEUE) {
        builder = builder.queue(
            queue.clone(),
            Arc::new(handler_fn(|id, payload| async move {
                tracing::info!(task_id = %id, ?payload, "handled");
                Ok::<_, HandlerError>(())
            })),
        )?;
    }
    let worker = builder.build()?;
    let queues = worker.queue_names();

    if std::env::var("SPOOL_DEMO_TASKS").map_or(true, |v| v != "0") {
        submit_demo_tasks(store.as_ref(), &queues).await?;
    }

    let report = worker
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;

    tracing::info!(
        totals = ?report.totals(),
        report = %serde_json::to_string(&report)?,
        "worker finished"
    );
    for (queue, depths) in queue_status(store.as_ref(), &queues).await? {
        tracing::info!(queue = %queue, ?depths, "final queue depths");
    }
    Ok(())
}
