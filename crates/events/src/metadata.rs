//! Header-based metadata encoding.
//!
//! Structured command/event fields travel as transport headers with fixed
//! names. These names are never exposed through the free-form header map:
//! decoding strips them, encoding re-injects them and rejects user headers
//! that try to reuse them.

use std::collections::BTreeMap;

use tracing::warn;

use commander_core::{DecodeError, EncodeError, FieldError};

use crate::message::Header;

pub const ACTION_HEADER: &str = "action";
pub const ID_HEADER: &str = "id";
pub const VERSION_HEADER: &str = "version";
pub const PARENT_HEADER: &str = "parent";
pub const STATUS_HEADER: &str = "status";
pub const TIMESTAMP_HEADER: &str = "timestamp";

/// Headers owned by command metadata.
pub const COMMAND_HEADERS: &[&str] = &[ACTION_HEADER, ID_HEADER, VERSION_HEADER];

/// Headers owned by event metadata.
pub const EVENT_HEADERS: &[&str] = &[
    ACTION_HEADER,
    ID_HEADER,
    VERSION_HEADER,
    PARENT_HEADER,
    STATUS_HEADER,
    TIMESTAMP_HEADER,
];

/// Stand-in for an absent payload. Structured decoders downstream accept it,
/// unlike a zero-length value.
pub const NULL_PAYLOAD: &[u8] = b"null";

pub fn normalize_payload(data: Vec<u8>) -> Vec<u8> {
    if data.is_empty() {
        NULL_PAYLOAD.to_vec()
    } else {
        data
    }
}

/// Encode user headers after the metadata headers, refusing reserved names.
pub(crate) fn append_user_headers(
    out: &mut Vec<Header>,
    user: &BTreeMap<String, String>,
    reserved: &[&str],
) -> Result<(), EncodeError> {
    for (key, value) in user {
        if reserved.contains(&key.as_str()) {
            return Err(EncodeError::ReservedHeader(key.clone()));
        }
        out.push(Header::new(key.clone(), value.as_bytes().to_vec()));
    }
    Ok(())
}

pub(crate) fn header_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

pub(crate) fn parse_version(value: &str) -> Result<i8, DecodeError> {
    value
        .trim()
        .parse::<i8>()
        .map_err(|e| DecodeError::InvalidVersion {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// A decoded value plus the soft field errors collected while decoding it.
///
/// A soft error (for example an unparsable key) does not stop decoding; the
/// field keeps its nil default. Callers pick a policy explicitly with
/// [`Populated::into_strict`] or [`Populated::into_lenient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Populated<T> {
    value: T,
    field_errors: Vec<FieldError>,
}

impl<T> Populated<T> {
    pub fn new(value: T, field_errors: Vec<FieldError>) -> Self {
        Self {
            value,
            field_errors,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.field_errors.is_empty()
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn field_errors(&self) -> &[FieldError] {
        &self.field_errors
    }

    /// Reject the value if any field failed to decode.
    pub fn into_strict(self) -> Result<T, DecodeError> {
        if self.field_errors.is_empty() {
            Ok(self.value)
        } else {
            Err(DecodeError::InvalidFields(self.field_errors))
        }
    }

    /// Accept the value, logging every field that failed to decode.
    pub fn into_lenient(self) -> T {
        for err in &self.field_errors {
            warn!(field = err.field, value = %err.value, reason = %err.reason, "field decoded with defaults");
        }
        self.value
    }

    pub fn into_parts(self) -> (T, Vec<FieldError>) {
        (self.value, self.field_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_becomes_null_marker() {
        assert_eq!(normalize_payload(Vec::new()), b"null".to_vec());
        assert_eq!(normalize_payload(b"{}".to_vec()), b"{}".to_vec());
    }

    #[test]
    fn reserved_user_header_is_rejected() {
        let mut user = BTreeMap::new();
        user.insert("action".to_string(), "spoof".to_string());
        let mut out = Vec::new();

        let err = append_user_headers(&mut out, &user, COMMAND_HEADERS).unwrap_err();
        assert_eq!(err, EncodeError::ReservedHeader("action".to_string()));
    }

    #[test]
    fn event_only_names_are_free_on_commands() {
        let mut user = BTreeMap::new();
        user.insert("parent".to_string(), "x".to_string());
        let mut out = Vec::new();

        append_user_headers(&mut out, &user, COMMAND_HEADERS).unwrap();
        assert_eq!(out.len(), 1);
        assert!(append_user_headers(&mut Vec::new(), &user, EVENT_HEADERS).is_err());
    }

    #[test]
    fn version_must_fit_a_small_integer() {
        assert_eq!(parse_version("7").unwrap(), 7);
        assert!(matches!(
            parse_version("300"),
            Err(DecodeError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn strict_promotes_soft_errors() {
        let populated = Populated::new(1u8, vec![FieldError::new("key", "", "empty")]);
        assert!(!populated.is_clean());
        assert!(matches!(
            populated.clone().into_strict(),
            Err(DecodeError::InvalidFields(errs)) if errs.len() == 1
        ));
        assert_eq!(populated.into_lenient(), 1);
    }
}
