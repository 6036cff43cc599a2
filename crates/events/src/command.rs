use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use commander_core::{CommandId, DecodeError, EncodeError, StreamKey};

use crate::event::{Event, StatusCode};
use crate::message::{Header, Message, Topic};
use crate::metadata::{
    self, ACTION_HEADER, COMMAND_HEADERS, ID_HEADER, Populated, VERSION_HEADER,
};

/// A request to perform an action on the stream identified by `key`.
///
/// Commands are transient: an inbound command lives for one handler
/// invocation, an outbound one until it is produced (and, for synchronous
/// calls, until its reply arrives or the call times out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub key: StreamKey,
    pub headers: BTreeMap<String, String>,
    pub id: CommandId,
    pub action: String,
    pub data: Vec<u8>,
    pub version: i8,
    /// Topic the command was read from; unset for locally built commands.
    #[serde(skip)]
    pub origin: Option<Topic>,
}

impl Command {
    /// Build a new command with a fresh id.
    pub fn new(
        action: impl Into<String>,
        version: i8,
        key: StreamKey,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key,
            headers: BTreeMap::new(),
            id: CommandId::new(),
            action: action.into(),
            data: metadata::normalize_payload(data.into()),
            version,
            origin: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Successful reply to this command.
    pub fn new_event(&self, action: impl Into<String>, version: i8, data: impl Into<Vec<u8>>) -> Event {
        Event::new(action, version, self.id, self.key, data)
    }

    /// Error reply to this command.
    pub fn new_error(&self, action: impl Into<String>, data: impl Into<Vec<u8>>) -> Event {
        Event::new(action, 0, self.id, self.key, data).with_status(StatusCode::INTERNAL_ERROR)
    }

    /// Decode a command from a message.
    ///
    /// An unparsable version or a missing action aborts decoding. An
    /// unparsable key or id header is recorded on the result and the field
    /// is left nil.
    pub fn populate(message: &Message) -> Result<Populated<Self>, DecodeError> {
        let mut command = Command {
            key: StreamKey::nil(),
            headers: BTreeMap::new(),
            id: CommandId::nil(),
            action: String::new(),
            data: Vec::new(),
            version: 0,
            origin: Some(message.topic.clone()),
        };
        let mut field_errors = Vec::new();

        for header in &message.headers {
            let value = metadata::header_text(&header.value);

            match header.key.as_str() {
                ACTION_HEADER => command.action = value,
                ID_HEADER => match CommandId::parse_field(ID_HEADER, &value) {
                    Ok(id) => command.id = id,
                    Err(err) => field_errors.push(err),
                },
                VERSION_HEADER => command.version = metadata::parse_version(&value)?,
                _ => {
                    command.headers.insert(header.key.clone(), value);
                }
            }
        }

        match StreamKey::parse_field("key", &metadata::header_text(&message.key)) {
            Ok(key) => command.key = key,
            Err(err) => field_errors.push(err),
        }

        if command.action.is_empty() {
            return Err(DecodeError::MissingAction);
        }

        command.data = metadata::normalize_payload(message.value.clone());

        Ok(Populated::new(command, field_errors))
    }

    /// Encode this command for the given topic.
    pub fn to_message(&self, topic: &Topic) -> Result<Message, EncodeError> {
        let mut headers = vec![
            Header::new(ACTION_HEADER, self.action.as_bytes().to_vec()),
            Header::new(ID_HEADER, self.id.to_string().into_bytes()),
            Header::new(VERSION_HEADER, self.version.to_string().into_bytes()),
        ];
        metadata::append_user_headers(&mut headers, &self.headers, COMMAND_HEADERS)?;

        Ok(Message {
            topic: topic.clone(),
            key: self.key.to_string().into_bytes(),
            value: self.data.clone(),
            headers,
        })
    }
}

impl TryFrom<&Message> for Command {
    type Error = DecodeError;

    /// Strict decoding: any field error fails the conversion.
    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        Command::populate(message)?.into_strict()
    }
}
