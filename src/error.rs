//! Docket error types

use thiserror::Error;

use crate::envelope::{ErrorReason, TaskId};
use crate::tracker::TaskState;

/// Errors raised while constructing or decoding an envelope
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvelopeError {
    /// Envelopes must belong to a conversation
    #[error("Envelope is missing a conversation id")]
    MissingConversation,

    /// TTL must be strictly positive
    #[error("Envelope ttl must be greater than zero")]
    NonPositiveTtl,

    /// Sender is required
    #[error("Envelope is missing a sender")]
    MissingSender,

    /// Payload did not match the shape implied by the message type
    #[error("Invalid {expected} payload: {detail}")]
    InvalidPayload {
        expected: &'static str,
        detail: String,
    },
}

/// Errors raised by the task tracker
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrackerError {
    /// Unknown task
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Task has not reached a terminal state
    #[error("Task still running: {0}")]
    TaskStillRunning(TaskId),

    /// Transition not permitted by the lifecycle
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

/// Failure returned by a router handler; the router turns it into an ERROR
/// envelope so callers never see the raw error
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{reason}: {detail}")]
pub struct HandlerError {
    pub reason: ErrorReason,
    pub detail: String,
}

impl HandlerError {
    pub fn new(reason: ErrorReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn upstream_unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorReason::UpstreamUnavailable, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorReason::InternalError, detail)
    }

    pub fn timed_out(detail: impl Into<String>) -> Self {
        Self::new(ErrorReason::TimedOut, detail)
    }
}

/// Errors reported by an event store backend
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Store could not be reached
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// Envelope could not be persisted
    #[error("Event store rejected envelope: {0}")]
    Rejected(String),
}

/// Errors reported by the external text generator
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Generator could not be reached
    #[error("Synthesis backend unavailable: {0}")]
    Unavailable(String),

    /// Generator returned something unusable
    #[error("Synthesis failed: {0}")]
    Failed(String),
}

/// Errors that can occur in the docket core
#[derive(Debug, Error)]
pub enum DocketError {
    /// Envelope construction/decoding error
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Task tracker error
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Query rejected before a task was created
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for DocketError {
    fn from(err: config::ConfigError) -> Self {
        DocketError::Config(err.to_string())
    }
}

/// Result alias for docket operations
pub type Result<T> = std::result::Result<T, DocketError>;
