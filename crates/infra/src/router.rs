//! Action-keyed dispatch table.
//!
//! Routes are registered while a group is being built and are read-only once
//! its subscriptions start.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use commander_core::ConfigError;
use commander_events::{Command, Event, Topic, TopicKind};

use crate::responder::Responder;

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(Command),
    Event(Event),
}

impl Inbound {
    pub fn kind(&self) -> TopicKind {
        match self {
            Inbound::Command(_) => TopicKind::Command,
            Inbound::Event(_) => TopicKind::Event,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            Inbound::Command(command) => &command.action,
            Inbound::Event(event) => event.action(),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Inbound::Command(command) => Uuid::from(command.id),
            Inbound::Event(event) => Uuid::from(event.id()),
        }
    }

    pub fn origin(&self) -> Option<&Topic> {
        match self {
            Inbound::Command(command) => command.origin.as_ref(),
            Inbound::Event(event) => event.origin(),
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Inbound::Command(command) => Some(command),
            Inbound::Event(_) => None,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Inbound::Event(event) => Some(event),
            Inbound::Command(_) => None,
        }
    }
}

/// Processes one inbound command or event.
///
/// Returning `Err` nacks the message; producing an error event and returning
/// `Ok` acks it.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, responder: &Responder, inbound: Inbound) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&Responder, Inbound) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, responder: &Responder, inbound: Inbound) -> anyhow::Result<()> {
        self(responder, inbound)
    }
}

/// Result of routing one message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No route for the action. Expected when services share a topic.
    Unhandled,
}

#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<(TopicKind, String), Arc<dyn Handler>>,
}

impl core::fmt::Debug for Router {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<_> = self.routes.keys().collect();
        keys.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
        f.debug_struct("Router").field("routes", &keys).finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `(kind, action)`. Each key takes exactly one
    /// handler.
    pub fn handle_func(
        &mut self,
        kind: TopicKind,
        action: impl Into<String>,
        handler: impl Handler,
    ) -> Result<(), ConfigError> {
        let action = action.into();
        if action.is_empty() {
            return Err(ConfigError::EmptyAction);
        }

        let key = (kind, action);
        if self.routes.contains_key(&key) {
            return Err(ConfigError::DuplicateHandler {
                kind: kind.as_str(),
                action: key.1,
            });
        }
        self.routes.insert(key, Arc::new(handler));
        Ok(())
    }

    pub fn route(&self, kind: TopicKind, action: &str) -> Option<&Arc<dyn Handler>> {
        self.routes.get(&(kind, action.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Invoke the matching handler, if any.
    pub fn dispatch(&self, responder: &Responder, inbound: Inbound) -> anyhow::Result<Dispatch> {
        match self.route(inbound.kind(), inbound.action()) {
            Some(handler) => {
                handler.handle(responder, inbound)?;
                Ok(Dispatch::Handled)
            }
            None => {
                debug!(kind = %inbound.kind(), action = inbound.action(), "no handler for action");
                Ok(Dispatch::Unhandled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use commander_core::{CommandId, StreamKey};
    use commander_events::MockDialect;

    use crate::responder::Outbound;

    fn responder() -> Responder {
        let outbound = Outbound::new(Arc::new(MockDialect::new()), Vec::new());
        Responder::new(Arc::new(outbound), CommandId::new(), StreamKey::new())
    }

    fn command(action: &str) -> Inbound {
        Inbound::Command(Command::new(action, 1, StreamKey::new(), Vec::new()))
    }

    fn noop(_: &Responder, _: Inbound) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn duplicate_route_is_a_config_error() {
        let mut router = Router::new();
        router.handle_func(TopicKind::Command, "example", noop).unwrap();
        // Same action on the other kind is a different key.
        router.handle_func(TopicKind::Event, "example", noop).unwrap();

        assert_eq!(
            router.handle_func(TopicKind::Command, "example", noop),
            Err(ConfigError::DuplicateHandler {
                kind: "command",
                action: "example".to_string()
            })
        );
        assert_eq!(
            router.handle_func(TopicKind::Command, "", noop),
            Err(ConfigError::EmptyAction)
        );
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn dispatches_by_kind_and_action() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        let log = Arc::clone(&seen);
        router
            .handle_func(TopicKind::Command, "example", move |_: &Responder, inbound: Inbound| -> anyhow::Result<()> {
                log.lock().unwrap().push(inbound.action().to_string());
                Ok(())
            })
            .unwrap();

        let r = responder();
        assert_eq!(router.dispatch(&r, command("example")).unwrap(), Dispatch::Handled);
        assert_eq!(router.dispatch(&r, command("other")).unwrap(), Dispatch::Unhandled);
        assert_eq!(*seen.lock().unwrap(), vec!["example".to_string()]);
    }

    #[test]
    fn inbound_id_is_the_message_id() {
        let command = Command::new("example", 1, StreamKey::new(), Vec::new());
        let event = command.new_event("created", 1, Vec::new());

        assert_eq!(Inbound::Command(command.clone()).id(), *command.id.as_uuid());
        assert_eq!(Inbound::Event(event.clone()).id(), *event.id().as_uuid());
        assert_eq!(Inbound::Event(event).kind(), TopicKind::Event);
    }

    #[test]
    fn handler_errors_propagate() {
        let mut router = Router::new();
        router
            .handle_func(TopicKind::Command, "example", |_: &Responder, _: Inbound| -> anyhow::Result<()> {
                anyhow::bail!("rejected")
            })
            .unwrap();

        let err = router.dispatch(&responder(), command("example")).unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }
}
