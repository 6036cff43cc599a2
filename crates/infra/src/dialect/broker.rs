//! The partitioned log a [`super::LogDialect`] runs on.
//!
//! Records are appended to one partition of a topic and addressed by
//! `(topic, partition, offset)`. Consumers read from a cursor and commit
//! per-group positions; nothing is ever deleted or rewritten.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use commander_events::Header;

/// One entry as the broker stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
}

/// Address of a record in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub record: Record,
    pub position: Position,
}

/// Next offset to read, per partition. Missing partitions start at 0.
pub type Cursor = BTreeMap<u32, u64>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("unknown topic {0:?}")]
    UnknownTopic(String),

    #[error("broker is closed")]
    Closed,

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

pub trait Broker: Send + Sync {
    fn partitions(&self, topic: &str) -> Result<u32, BrokerError>;

    /// Append a record; the broker picks the partition from the key.
    fn produce(&self, record: Record) -> Result<Position, BrokerError>;

    /// Up to `max` records at or after `cursor`, in offset order within each
    /// partition. Blocks for at most `wait` while nothing is available.
    fn fetch(
        &self,
        topic: &str,
        cursor: &Cursor,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<FetchedRecord>, BrokerError>;

    /// Next offset `group` should read from `partition`, if it ever committed.
    fn committed(&self, group: &str, topic: &str, partition: u32)
    -> Result<Option<u64>, BrokerError>;

    /// Mark `position` and everything before it in its partition as consumed
    /// by `group`.
    fn commit(&self, group: &str, position: &Position) -> Result<(), BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn partitions(&self, topic: &str) -> Result<u32, BrokerError> {
        (**self).partitions(topic)
    }

    fn produce(&self, record: Record) -> Result<Position, BrokerError> {
        (**self).produce(record)
    }

    fn fetch(
        &self,
        topic: &str,
        cursor: &Cursor,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<FetchedRecord>, BrokerError> {
        (**self).fetch(topic, cursor, max, wait)
    }

    fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BrokerError> {
        (**self).committed(group, topic, partition)
    }

    fn commit(&self, group: &str, position: &Position) -> Result<(), BrokerError> {
        (**self).commit(group, position)
    }
}
