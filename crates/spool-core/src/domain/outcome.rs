//! Outcome model: the result of one dispatch attempt.
//!
//! Created by the dispatcher right after the handler returns and consumed by
//! the retry policy in the same loop iteration. Never persisted.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler finished normally.
    Success,

    /// Recoverable failure: business error, crash or timeout.
    RetryableFailure(String),

    /// The handler declared the task unprocessable.
    FatalFailure(String),
}

impl Outcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::RetryableFailure(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Outcome::FatalFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::RetryableFailure(reason) | Outcome::FatalFailure(reason) => Some(reason),
        }
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RetryableFailure(_) => "retryable_failure",
            Outcome::FatalFailure(_) => "fatal_failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.kind(), reason),
            None => f.write_str(self.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_is_exposed_for_failures_only() {
        assert_eq!(Outcome::Success.reason(), None);
        assert_eq!(Outcome::retryable("busy").reason(), Some("busy"));
        assert_eq!(Outcome::fatal("bad input").reason(), Some("bad input"));
    }

    #[test]
    fn display_includes_kind_and_reason() {
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(
            Outcome::fatal("bad input").to_string(),
            "fatal_failure: bad input"
        );
    }
}
