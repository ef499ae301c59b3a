//! Task envelope and its wire codec.
//!
//! The envelope is what travels through the broker: identity, payload and the
//! bookkeeping the worker needs (attempt count, timestamps). The wire form is
//! JSON. Encoding is deterministic because `serde_json::Map` keeps its keys
//! sorted, and decoding ignores fields it does not know so that newer
//! producers can add metadata without breaking older workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

use super::ids::TaskId;

/// Structured task payload (string keys to arbitrary JSON values).
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Why a raw entry could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not valid JSON at all.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Valid JSON, but not an envelope (missing `id`/`payload`, wrong types).
    #[error("invalid envelope: {0}")]
    Invalid(String),

    #[error("invalid envelope: empty task id")]
    EmptyId,
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Data => DecodeError::Invalid(err.to_string()),
            Category::Io | Category::Syntax | Category::Eof => {
                DecodeError::Malformed(err.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// The unit of work moved through the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: TaskId,

    /// Logical queue name (never the staging key).
    #[serde(default)]
    pub queue_name: String,

    pub payload: Payload,

    /// Number of dispatches so far.
    #[serde(default)]
    pub attempt_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_at: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(id: TaskId, queue_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            id,
            queue_name: queue_name.into(),
            payload,
            attempt_count: 0,
            enqueued_at: None,
            staged_at: None,
        }
    }

    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(at);
        self
    }

    /// Parse a raw broker entry.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        if envelope.id.is_empty() {
            return Err(DecodeError::EmptyId);
        }
        Ok(envelope)
    }

    /// Serialize into the broker wire form.
    pub fn encode(&self) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(self)?)
    }
}
