//! Error taxonomy.
//!
//! Setup failures (`ConfigError`) are fatal and reported at startup. Failures
//! local to one message (`DecodeError`, `AckError`) never abort a delivery
//! loop. `ProduceError` is surfaced to the caller and never retried here.
//! `SyncError` is what a blocking request/reply call returns.

use std::time::Duration;

use thiserror::Error;

use crate::id::CommandId;

/// A single field that could not be decoded.
///
/// Field errors are "soft": population keeps going and the caller decides
/// whether the value is acceptable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field} {value:?}: {reason}")]
pub struct FieldError {
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Malformed metadata or payload on an inbound message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no action header is set")]
    MissingAction,

    #[error("invalid version header {value:?}: {reason}")]
    InvalidVersion { value: String, reason: String },

    #[error("invalid status header {value:?}: {reason}")]
    InvalidStatus { value: String, reason: String },

    #[error("invalid timestamp header {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// Soft field errors promoted to a hard failure by a strict caller.
    #[error("{} invalid field(s), first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    InvalidFields(Vec<FieldError>),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// Converting a command/event into a message failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("header {0:?} is reserved for message metadata")]
    ReservedHeader(String),
}

/// Byte-level encoding of a message failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("marshal failed: {0}")]
    Encode(String),

    #[error("unmarshal failed: {0}")]
    Decode(String),
}

/// Invalid group setup. Always reported before any subscription starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("a handler for ({kind}, {action:?}) is already registered")]
    DuplicateHandler { kind: &'static str, action: String },

    #[error("handler action must not be empty")]
    EmptyAction,

    #[error("group has no topics")]
    NoTopics,

    #[error("topic {0:?} is declared more than once")]
    DuplicateTopic(String),

    #[error("topic name must not be empty")]
    EmptyTopicName,

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

/// The dialect refused or failed a write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProduceError {
    #[error("no producible {0} topic is configured")]
    NoTopic(&'static str),

    #[error("topic {0:?} is not producible")]
    NotProducible(String),

    #[error("producer is closed")]
    Closed,

    #[error("broker rejected the write: {0}")]
    Rejected(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// Creating or removing a subscription failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("consumer is closed")]
    Closed,

    #[error("no topics given")]
    NoTopics,

    #[error("topic {0:?} is not consumable")]
    NotConsumable(String),

    #[error("subscription {0} is unknown")]
    UnknownSubscription(u64),

    #[error("broker error: {0}")]
    Broker(String),
}

/// Processing of a delivered message failed; the message must not be
/// treated as consumed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("delivery dropped without acknowledgement")]
    Abandoned,
}

impl AckError {
    /// Decode failures are deterministic; redelivering the same bytes cannot
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AckError::Decode(_))
    }
}

/// Outcome of a synchronous command that did not receive a reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("no reply to command {id} within {after:?}")]
    Timeout { id: CommandId, after: Duration },

    #[error("command {0} was cancelled")]
    Cancelled(CommandId),

    #[error("group is shutting down")]
    Closed,

    #[error("a call for command {0} is already pending")]
    AlreadyPending(CommandId),

    #[error("no consumable event topic is configured")]
    NoEventTopic,

    #[error(transparent)]
    Produce(#[from] ProduceError),
}

impl SyncError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout { .. })
    }
}
