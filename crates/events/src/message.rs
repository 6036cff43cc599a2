use serde::{Deserialize, Serialize};

/// Whether a topic carries commands or events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Command,
    Event,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Command => "command",
            TopicKind::Event => "event",
        }
    }
}

impl core::fmt::Display for TopicKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named subject on the log.
///
/// `consume`/`produce` declare how a group uses the topic: only consumable
/// topics get a subscription, only producible topics are written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub kind: TopicKind,
    #[serde(default = "enabled")]
    pub consume: bool,
    #[serde(default = "enabled")]
    pub produce: bool,
}

fn enabled() -> bool {
    true
}

impl Topic {
    /// A topic that is both consumed and produced.
    pub fn new(name: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            name: name.into(),
            kind,
            consume: true,
            produce: true,
        }
    }

    pub fn command(name: impl Into<String>) -> Self {
        Self::new(name, TopicKind::Command)
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::new(name, TopicKind::Event)
    }

    pub fn with_consume(mut self, consume: bool) -> Self {
        self.consume = consume;
        self
    }

    pub fn with_produce(mut self, produce: bool) -> Self {
        self.produce = produce;
        self
    }
}

/// A single transport header. Names may repeat; order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The envelope placed on and read from the log.
///
/// Commands and events are derived from it; nothing else crosses the
/// transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: Topic,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
}

impl Message {
    pub fn new(topic: Topic, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic,
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    /// First header with the given name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == name)
            .map(|h| h.value.as_slice())
    }

    /// All headers with the given name, in wire order.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.key == name)
            .map(|h| h.value.as_slice())
    }
}
