//! Write path available to handlers and to the group itself.

use std::sync::Arc;

use tracing::instrument;

use commander_core::{CommandId, ProduceError, StreamKey};
use commander_events::{Command, Dialect, Event, StatusCode, Topic, TopicKind};

use crate::router::Inbound;

/// Encodes commands/events and hands them to the dialect's producer,
/// targeting the first producible topic of the matching kind.
pub struct Outbound {
    dialect: Arc<dyn Dialect>,
    topics: Vec<Topic>,
}

impl core::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Outbound")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl Outbound {
    pub fn new(dialect: Arc<dyn Dialect>, topics: Vec<Topic>) -> Self {
        Self { dialect, topics }
    }

    pub fn topic(&self, kind: TopicKind) -> Result<&Topic, ProduceError> {
        self.topics
            .iter()
            .find(|t| t.kind == kind && t.produce)
            .ok_or(ProduceError::NoTopic(kind.as_str()))
    }

    #[instrument(skip(self, command), fields(action = %command.action, id = %command.id), err)]
    pub fn produce_command(&self, command: &Command) -> Result<(), ProduceError> {
        let topic = self.topic(TopicKind::Command)?;
        let message = command.to_message(topic)?;
        self.dialect.producer().produce(message)
    }

    #[instrument(
        skip(self, event),
        fields(action = %event.action(), parent = %event.parent(), status = %event.status()),
        err
    )]
    pub fn produce_event(&self, event: &Event) -> Result<(), ProduceError> {
        let topic = self.topic(TopicKind::Event)?;
        let message = event.to_message(topic)?;
        self.dialect.producer().produce(message)
    }
}

/// Handed to every handler invocation.
///
/// Events produced through a responder answer `parent`: the inbound
/// command's id, or for an inbound event, the command that event answered.
#[derive(Debug, Clone)]
pub struct Responder {
    outbound: Arc<Outbound>,
    parent: CommandId,
    key: StreamKey,
}

impl Responder {
    pub fn new(outbound: Arc<Outbound>, parent: CommandId, key: StreamKey) -> Self {
        Self {
            outbound,
            parent,
            key,
        }
    }

    pub fn for_inbound(outbound: Arc<Outbound>, inbound: &Inbound) -> Self {
        match inbound {
            Inbound::Command(command) => Self::new(outbound, command.id, command.key),
            Inbound::Event(event) => Self::new(outbound, event.parent(), event.key()),
        }
    }

    pub fn parent(&self) -> CommandId {
        self.parent
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Emit a successful event answering the inbound message.
    pub fn produce_event(
        &self,
        action: impl Into<String>,
        version: i8,
        key: StreamKey,
        data: impl Into<Vec<u8>>,
    ) -> Result<Event, ProduceError> {
        let event = Event::new(action, version, self.parent, key, data);
        self.outbound.produce_event(&event)?;
        Ok(event)
    }

    /// Emit an error event (status 500) for the inbound message's stream.
    pub fn produce_error(
        &self,
        action: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Result<Event, ProduceError> {
        let event = Event::new(action, 0, self.parent, self.key, data)
            .with_status(StatusCode::INTERNAL_ERROR);
        self.outbound.produce_event(&event)?;
        Ok(event)
    }

    /// Emit a follow-up command, e.g. from a process-manager style handler.
    pub fn produce_command(
        &self,
        action: impl Into<String>,
        version: i8,
        key: StreamKey,
        data: impl Into<Vec<u8>>,
    ) -> Result<Command, ProduceError> {
        let command = Command::new(action, version, key, data);
        self.outbound.produce_command(&command)?;
        Ok(command)
    }
}
