//! Domain model: envelope, ids, outcomes, retry decisions and errors.

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;

pub use self::decision::{Action, MAX_ATTEMPTS_EXCEEDED, RetryPolicy};
pub use self::envelope::{DecodeError, EncodeError, Envelope, Payload};
pub use self::errors::{HandlerError, LoopError, QueueFailure, StoreError, WorkerError};
pub use self::ids::TaskId;
pub use self::outcome::Outcome;
