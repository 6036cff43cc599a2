use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use commander_core::{CommandId, DecodeError, EncodeError, EventId, StreamKey};

use crate::message::{Header, Message, Topic};
use crate::metadata::{
    self, ACTION_HEADER, EVENT_HEADERS, ID_HEADER, PARENT_HEADER, Populated, STATUS_HEADER,
    TIMESTAMP_HEADER, VERSION_HEADER,
};

/// Outcome code carried by an event (HTTP-style numbering).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);

    pub const fn from_u16(code: u16) -> Self {
        Self(code)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl core::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fact produced in response to a command.
///
/// `parent` is the id of the command this event answers and is the key
/// synchronous callers are correlated on. Events are immutable once built;
/// the `with_*` methods consume and return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    parent: CommandId,
    headers: BTreeMap<String, String>,
    id: EventId,
    action: String,
    data: Vec<u8>,
    key: StreamKey,
    status: StatusCode,
    version: i8,
    timestamp: DateTime<Utc>,
    #[serde(skip)]
    origin: Option<Topic>,
}

impl Event {
    /// Build a successful event answering `parent`.
    pub fn new(
        action: impl Into<String>,
        version: i8,
        parent: CommandId,
        key: StreamKey,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            parent,
            headers: BTreeMap::new(),
            id: EventId::new(),
            action: action.into(),
            data: metadata::normalize_payload(data.into()),
            key,
            status: StatusCode::OK,
            version,
            timestamp: Utc::now(),
            origin: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn parent(&self) -> CommandId {
        self.parent
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_error(&self) -> bool {
        !self.status.is_success()
    }

    pub fn version(&self) -> i8 {
        self.version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn origin(&self) -> Option<&Topic> {
        self.origin.as_ref()
    }

    /// Decode an event from a message.
    ///
    /// Follows the same rules as [`crate::Command::populate`]: a bad
    /// version, status or timestamp or a missing action aborts; a bad key,
    /// id or parent is recorded as a field error.
    pub fn populate(message: &Message) -> Result<Populated<Self>, DecodeError> {
        let mut event = Event {
            parent: CommandId::nil(),
            headers: BTreeMap::new(),
            id: EventId::nil(),
            action: String::new(),
            data: Vec::new(),
            key: StreamKey::nil(),
            status: StatusCode::OK,
            version: 0,
            timestamp: DateTime::<Utc>::default(),
            origin: Some(message.topic.clone()),
        };
        let mut field_errors = Vec::new();

        for header in &message.headers {
            let value = metadata::header_text(&header.value);

            match header.key.as_str() {
                ACTION_HEADER => event.action = value,
                ID_HEADER => match EventId::parse_field(ID_HEADER, &value) {
                    Ok(id) => event.id = id,
                    Err(err) => field_errors.push(err),
                },
                PARENT_HEADER => match CommandId::parse_field(PARENT_HEADER, &value) {
                    Ok(parent) => event.parent = parent,
                    Err(err) => field_errors.push(err),
                },
                VERSION_HEADER => event.version = metadata::parse_version(&value)?,
                STATUS_HEADER => event.status = parse_status(&value)?,
                TIMESTAMP_HEADER => event.timestamp = parse_timestamp(&value)?,
                _ => {
                    event.headers.insert(header.key.clone(), value);
                }
            }
        }

        match StreamKey::parse_field("key", &metadata::header_text(&message.key)) {
            Ok(key) => event.key = key,
            Err(err) => field_errors.push(err),
        }

        if event.action.is_empty() {
            return Err(DecodeError::MissingAction);
        }

        event.data = metadata::normalize_payload(message.value.clone());

        Ok(Populated::new(event, field_errors))
    }

    /// Encode this event for the given topic.
    pub fn to_message(&self, topic: &Topic) -> Result<Message, EncodeError> {
        let mut headers = vec![
            Header::new(ACTION_HEADER, self.action.as_bytes().to_vec()),
            Header::new(ID_HEADER, self.id.to_string().into_bytes()),
            Header::new(PARENT_HEADER, self.parent.to_string().into_bytes()),
            Header::new(VERSION_HEADER, self.version.to_string().into_bytes()),
            Header::new(STATUS_HEADER, self.status.to_string().into_bytes()),
            Header::new(
                TIMESTAMP_HEADER,
                self.timestamp
                    .to_rfc3339_opts(SecondsFormat::Nanos, true)
                    .into_bytes(),
            ),
        ];
        metadata::append_user_headers(&mut headers, &self.headers, EVENT_HEADERS)?;

        Ok(Message {
            topic: topic.clone(),
            key: self.key.to_string().into_bytes(),
            value: self.data.clone(),
            headers,
        })
    }
}

impl TryFrom<&Message> for Event {
    type Error = DecodeError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        Event::populate(message)?.into_strict()
    }
}

fn parse_status(value: &str) -> Result<StatusCode, DecodeError> {
    value
        .trim()
        .parse::<u16>()
        .map(StatusCode::from_u16)
        .map_err(|e| DecodeError::InvalidStatus {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DecodeError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}
