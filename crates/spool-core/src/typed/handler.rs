//! Handler traits - タスクを処理するハンドラの定義
//!
//! - `TaskHandler`: object-safe な生ペイロード用 trait（ポーリングループが呼ぶ）
//! - `Handler<T>`: ペイロードを `T` にデシリアライズして受け取る型付き trait
//! - `TypedHandler<T, H>`: `Handler<T>` → `TaskHandler` の型消去

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::{HandlerError, Payload, TaskId};

/// Processes one task.
///
/// `Ok(())` acknowledges the task. [`HandlerError::Retryable`] puts it back
/// for another attempt, [`HandlerError::Fatal`] dead-letters it. A panic is
/// treated as retryable.
///
/// ```ignore
/// struct Charge;
///
/// #[async_trait]
/// impl TaskHandler for Charge {
///     async fn handle(&self, id: &TaskId, payload: &Payload) -> Result<(), HandlerError> {
///         let amount = payload.get("amount").and_then(|v| v.as_u64())
///             .ok_or_else(|| HandlerError::fatal("amount missing"))?;
///         charge(id, amount).await.map_err(|e| HandlerError::retryable(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, id: &TaskId, payload: &Payload) -> Result<(), HandlerError>;
}

/// Typed handler: receives the payload already deserialized into `T`.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, id: &TaskId, task: T) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, id: &TaskId, payload: &Payload) -> Result<(), HandlerError> {
        // A payload that does not fit `T` never will; no point retrying.
        let task: T = serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|e| HandlerError::fatal(format!("payload decode: {e}")))?;
        self.handler.handle(id, task).await
    }
}

/// [`TaskHandler`] backed by a closure. Build one with [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure taking owned `(TaskId, Payload)` as a [`TaskHandler`].
///
/// ```ignore
/// let handler = handler_fn(|id, payload| async move {
///     tracing::info!(%id, ?payload, "got task");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskId, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskId, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, id: &TaskId, payload: &Payload) -> Result<(), HandlerError> {
        (self.f)(id.clone(), payload.clone()).await
    }
}
