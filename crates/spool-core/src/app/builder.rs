//! WorkerBuilder - ワーカーの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - キューごとにハンドラを 1 つ登録する（重複・不正な名前は登録時に弾く）
//! - build() で「キューが 1 つ以上ある」「設定が妥当」をチェック
//! - 起動してから設定ミスに気づくことがないようにする

use std::sync::Arc;

use super::config::{ConfigError, WorkerConfig};
use crate::ports::QueueStore;
use crate::typed::{Handler, HandlerRegistry, RegistryError, Task, TaskHandler};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no queues registered; a worker needs at least one")]
    NoQueues,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Builds a [`Worker`].
///
/// ```ignore
/// let worker = WorkerBuilder::new(store)
///     .config(config)
///     .queue("billing", Arc::new(BillingHandler))?
///     .register::<SendEmail, _>(EmailHandler)?
///     .build()?;
/// let report = worker.run_until(tokio::signal::ctrl_c().map(|_| ())).await?;
/// ```
pub struct WorkerBuilder {
    store: Arc<dyn QueueStore>,
    config: WorkerConfig,
    registry: HandlerRegistry,
}

impl WorkerBuilder {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            config: WorkerConfig::default(),
            registry: HandlerRegistry::new(),
        }
    }

    /// `config.queue_names` is ignored here; queues come from registrations.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.insert(name, handler)?;
        Ok(self)
    }

    /// Register a typed handler on `T::QUEUE`.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        if self.registry.is_empty() {
            return Err(BuildError::NoQueues);
        }
        self.config.validate()?;
        Ok(Worker {
            store: self.store,
            config: self.config,
            registry: self.registry,
        })
    }
}

/// A validated, not yet started worker. See [`Worker::start`] and
/// [`Worker::run_until`].
pub struct Worker {
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) config: WorkerConfig,
    pub(crate) registry: HandlerRegistry,
}

impl Worker {
    pub fn queue_names(&self) -> Vec<String> {
        self.registry.queue_names()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }
}
