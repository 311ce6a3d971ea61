//! Error Types
//!
//! Typed error kinds for the runtime paths of the connector. Construction
//! and composition errors (building apps, wiring flows) use `anyhow` with
//! context messages; everything that can fail while a message is in flight
//! is classified here so error policies and `nack_reaction` overrides can
//! match on the kind.

use serde::Deserialize;
use thiserror::Error;

/// Coarse classification of a processing failure, used by stage error
/// policies and component `nack_reaction` overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Expression,
    Transform,
    Invoke,
    Timeout,
    Session,
    Queue,
    Broker,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Expression => "expression",
            ErrorKind::Transform => "transform",
            ErrorKind::Invoke => "invoke",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Session => "session",
            ErrorKind::Queue => "queue",
            ErrorKind::Broker => "broker",
        }
    }
}

/// A failure raised while a message is traversing a flow.
#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    /// An expression could not resolve a required source.
    #[error("expression error: {0}")]
    Expression(String),

    /// A map/filter/reduce transform step failed.
    #[error("transform error in step {step}: {reason}")]
    Transform { step: usize, reason: String },

    /// A component `invoke` raised.
    #[error("invoke error in '{component}': {reason}")]
    Invoke { component: String, reason: String },

    /// A request/response waiter deadline elapsed.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// `create_session` was called with `max_sessions` already active.
    #[error("session limit exceeded ({0} sessions active)")]
    SessionLimitExceeded(usize),

    /// A `session_id` did not resolve to a live controller.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// The controller behind an outstanding request was destroyed.
    #[error("session '{0}' closed")]
    SessionClosed(String),

    /// An inter-stage queue was closed while a message was being handed
    /// over; only observed during shutdown draining.
    #[error("queue closed during shutdown")]
    QueueClosed,

    /// A broker transport operation failed.
    #[error("broker error: {0}")]
    Broker(String),
}

impl ProcessingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessingError::Expression(_) => ErrorKind::Expression,
            ProcessingError::Transform { .. } => ErrorKind::Transform,
            ProcessingError::Invoke { .. } => ErrorKind::Invoke,
            ProcessingError::Timeout(_) => ErrorKind::Timeout,
            ProcessingError::SessionLimitExceeded(_)
            | ProcessingError::SessionNotFound(_)
            | ProcessingError::SessionClosed(_) => ErrorKind::Session,
            ProcessingError::QueueClosed => ErrorKind::Queue,
            ProcessingError::Broker(_) => ErrorKind::Broker,
        }
    }

    pub fn invoke(component: &str, reason: impl Into<String>) -> Self {
        ProcessingError::Invoke {
            component: component.to_string(),
            reason: reason.into(),
        }
    }
}

/// Invalid or missing configuration, fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field '{field}' in {location}")]
    MissingField { location: String, field: String },

    #[error("duplicate name '{name}' in {location}")]
    Duplicate { location: String, name: String },

    #[error("unknown component kind '{kind}' for stage '{stage}'")]
    UnknownKind { stage: String, kind: String },

    #[error("{location}: {reason}")]
    Invalid { location: String, reason: String },

    #[error("'{reference}' referenced by {location} does not exist")]
    BadReference { location: String, reference: String },
}

impl ConfigError {
    pub fn invalid(location: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// What a stage does with a message whose processing failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Release the message as handled so the broker does not redeliver.
    Drop,

    /// Resolve the message's ACK callbacks as failed (default).
    #[default]
    Nack,

    /// Route a synthetic error event to the app's error flow, then release
    /// the original message.
    ErrorFlow,
}

/// Component-level override for how a failed message is settled with the
/// broker, consulted before the stage's configured policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReaction {
    /// Fail the ACK callbacks so the broker redelivers.
    Redeliver,

    /// Release the message as handled; the broker drops it.
    Discard,
}
