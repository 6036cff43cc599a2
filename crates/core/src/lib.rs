//! `commander-core`: identifiers and the error taxonomy shared by every
//! commander crate.
//!
//! This crate has no transport or runtime concerns.

pub mod error;
pub mod id;

pub use error::{
    AckError, ConfigError, DecodeError, EncodeError, FieldError, MarshalError, ProduceError,
    SubscribeError, SyncError,
};
pub use id::{CommandId, EventId, StreamKey};
