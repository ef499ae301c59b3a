//! Task trait - 型付きタスクとキューの対応付け
//!
//! `Task::QUEUE` binds a payload type to the queue it travels on, so producers
//! and handlers cannot disagree about queue names.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Payload, StoreError, TaskId};
use crate::ports::QueueStore;

/// A payload type with a fixed queue.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendInvoice {
///     customer_id: String,
/// }
///
/// impl Task for SendInvoice {
///     const QUEUE: &'static str = "billing";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const QUEUE: &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("task must serialize to a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("task encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Serialize `task` into an envelope payload.
pub fn to_payload<T: Task>(task: &T) -> Result<Payload, SubmitError> {
    match serde_json::to_value(task)? {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Err(SubmitError::NotAnObject("null")),
        serde_json::Value::Bool(_) => Err(SubmitError::NotAnObject("a boolean")),
        serde_json::Value::Number(_) => Err(SubmitError::NotAnObject("a number")),
        serde_json::Value::String(_) => Err(SubmitError::NotAnObject("a string")),
        serde_json::Value::Array(_) => Err(SubmitError::NotAnObject("an array")),
    }
}

/// Submit `task` to `T::QUEUE`.
pub async fn submit_task<T: Task>(
    store: &dyn QueueStore,
    task: &T,
    id: Option<TaskId>,
) -> Result<TaskId, SubmitError> {
    let payload = to_payload(task)?;
    Ok(store.submit(T::QUEUE, payload, id).await?)
}
