//! Error taxonomy for the trip event subsystem

use crate::envelope::EventType;
use event_bus::BusError;
use std::fmt;
use std::time::Duration;

/// One failing handler inside an aggregated routing error
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub event_type: EventType,
    pub error: anyhow::Error,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {:#}", self.handler, self.event_type, self.error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] BusError),

    #[error("subscription already exists for trip {trip_id} user {user_id}")]
    DuplicateSubscription { trip_id: String, user_id: String },

    #[error("handler name already registered: {0}")]
    DuplicateName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{} handler(s) failed: {}", .0.len(), join_failures(.0))]
    HandlerFailures(Vec<HandlerFailure>),
}

fn join_failures(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EventError {
    /// Whether the caller may retry the same call
    ///
    /// Only transport-class failures qualify; input errors never succeed on
    /// retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventError::Transport(_) | EventError::Timeout(_))
    }

    /// Value of the `type` label on `event_errors_total`
    pub fn metric_label(&self) -> &'static str {
        match self {
            EventError::Validation(_) => "validation",
            EventError::Serialization(_) => "marshal",
            EventError::Transport(_) => "transport",
            EventError::DuplicateSubscription { .. } | EventError::DuplicateName(_) => "duplicate",
            EventError::NotFound(_) => "not_found",
            EventError::Cancelled => "cancelled",
            EventError::Timeout(_) => "timeout",
            EventError::HandlerFailures(_) => "handler",
        }
    }
}

pub type EventResult<T> = Result<T, EventError>;
