//! Byte-level encoding of messages for transports that carry opaque blobs.

use commander_core::MarshalError;

use crate::message::Message;

/// Symmetric, deterministic message encoding.
///
/// For every message `m`, `unmarshal(&marshal(&m)?)? == m`.
pub trait Marshaller: Send + Sync {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>, MarshalError>;

    fn unmarshal(&self, chunk: &[u8]) -> Result<Message, MarshalError>;
}

/// JSON encoding via `serde_json`.
#[derive(Debug, Default, Copy, Clone)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>, MarshalError> {
        serde_json::to_vec(message).map_err(|e| MarshalError::Encode(e.to_string()))
    }

    fn unmarshal(&self, chunk: &[u8]) -> Result<Message, MarshalError> {
        serde_json::from_slice(chunk).map_err(|e| MarshalError::Decode(e.to_string()))
    }
}
