//! Subscription and acknowledgement contract.
//!
//! A consumer hands out [`Subscription`]s. Every message a subscription
//! yields arrives as a [`Delivery`] that owns its acknowledgement handle, so
//! exactly one ack is written per delivered message:
//!
//! - [`Delivery::ack`] marks the message processed; the consumer may advance
//!   past it.
//! - [`Delivery::nack`] marks it failed; the consumer must not advance past
//!   it and applies its own redelivery/dead-letter policy.
//! - dropping a delivery unacknowledged counts as a nack with
//!   [`AckError::Abandoned`].
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let subscription = dialect.consumer().subscribe(&[topic])?;
//!
//! loop {
//!     match subscription.recv_timeout(Duration::from_millis(250)) {
//!         Ok(delivery) => match process(delivery.message()) {
//!             Ok(()) => delivery.ack(),
//!             Err(err) => delivery.nack(err),
//!         },
//!         Err(RecvTimeoutError::Timeout) => continue,
//!         Err(RecvTimeoutError::Disconnected) => break, // unsubscribed or closed
//!     }
//! }
//! ```
//!
//! ## Ordering
//!
//! Within one partition a subscription yields messages in log order, and
//! consumers only hand out the next message of a partition after the
//! previous one was acknowledged. Nothing is guaranteed across partitions,
//! topics or subscribers.

use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use commander_core::{AckError, SubscribeError};

use crate::message::{Message, Topic};

/// Identifies one subscriber within a consumer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type AckResult = Result<(), AckError>;

/// One acknowledgement as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub subscription: SubscriptionId,
    /// Per-subscription delivery counter, starting at zero.
    pub sequence: u64,
    pub result: AckResult,
}

/// Write side of the acknowledgement channel for a single delivery.
///
/// Settles at most once; if it is dropped unsettled it reports
/// [`AckError::Abandoned`]. Writes after the consumer went away are no-ops.
#[derive(Debug)]
pub struct Acker {
    subscription: SubscriptionId,
    sequence: u64,
    sender: Option<Sender<Ack>>,
}

impl Acker {
    pub fn new(subscription: SubscriptionId, sequence: u64, sender: Sender<Ack>) -> Self {
        Self {
            subscription,
            sequence,
            sender: Some(sender),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn settle(mut self, result: AckResult) {
        self.send(result);
    }

    fn send(&mut self, result: AckResult) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Ack {
                subscription: self.subscription,
                sequence: self.sequence,
                result,
            });
        }
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        self.send(Err(AckError::Abandoned));
    }
}

/// A delivered message together with its acknowledgement handle.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    acker: Acker,
}

impl Delivery {
    pub fn new(message: Message, acker: Acker) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn sequence(&self) -> u64 {
        self.acker.sequence
    }

    pub fn ack(self) {
        self.acker.settle(Ok(()));
    }

    pub fn nack(self, err: AckError) {
        self.acker.settle(Err(err));
    }

    /// Split into the message and its pending acknowledgement.
    pub fn into_parts(self) -> (Message, Acker) {
        (self.message, self.acker)
    }
}

/// Read side of one subscription.
///
/// Designed for single-threaded consumption; the stream disconnects once the
/// subscription is removed or the consumer is closed.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topics: Vec<Topic>,
    receiver: Receiver<Delivery>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, topics: Vec<Topic>, receiver: Receiver<Delivery>) -> Self {
        Self {
            id,
            topics,
            receiver,
        }
    }

    /// Create a subscription and the sender a consumer pushes deliveries into.
    pub fn channel(id: SubscriptionId, topics: Vec<Topic>) -> (Sender<Delivery>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self::new(id, topics, rx))
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Block until the next delivery is available.
    pub fn recv(&self) -> Result<Delivery, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a delivery without blocking.
    pub fn try_recv(&self) -> Result<Delivery, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a delivery.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivery, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Consumer side of a dialect.
///
/// Multiple subscriptions may cover the same topic; each receives every
/// message (fan-out) and acknowledges independently.
pub trait Consumer: Send + Sync {
    fn subscribe(&self, topics: &[Topic]) -> Result<Subscription, SubscribeError>;

    /// Detach one subscriber without affecting others on the same topics.
    fn unsubscribe(&self, subscription: &Subscription) -> Result<(), SubscribeError>;

    /// Stop every subscription and release consumer resources. Idempotent.
    fn close(&self) -> Result<(), SubscribeError>;
}
