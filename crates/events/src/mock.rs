//! In-process dialect for tests/dev.
//!
//! - No IO, no broker
//! - Every produced message goes through the marshaller and back before it is
//!   delivered, so codec bugs show up here too
//! - Fan-out to every subscriber of the topic, in produce order
//! - Acks are recorded for inspection; there is no redelivery

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use commander_core::{ProduceError, SubscribeError};

use crate::consumer::{Ack, Acker, Consumer, Delivery, Subscription, SubscriptionId};
use crate::dialect::{Dialect, Producer};
use crate::marshal::{JsonMarshaller, Marshaller};
use crate::message::{Message, Topic};

#[derive(Debug)]
struct MockSubscriber {
    id: SubscriptionId,
    topics: Vec<String>,
    sender: Sender<Delivery>,
    next_sequence: u64,
}

#[derive(Debug, Default)]
struct State {
    subscribers: Vec<MockSubscriber>,
    produced: Vec<Message>,
}

#[derive(Debug)]
struct Inner {
    marshaller: JsonMarshaller,
    state: Mutex<State>,
    ack_tx: Sender<Ack>,
    ack_rx: Mutex<Receiver<Ack>>,
    ack_log: Mutex<Vec<Ack>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// In-memory dialect. Cloning shares the same topics and subscribers.
#[derive(Debug, Clone)]
pub struct MockDialect {
    inner: Arc<Inner>,
}

impl Default for MockDialect {
    fn default() -> Self {
        let (ack_tx, ack_rx) = mpsc::channel();
        Self {
            inner: Arc::new(Inner {
                marshaller: JsonMarshaller,
                state: Mutex::new(State::default()),
                ack_tx,
                ack_rx: Mutex::new(ack_rx),
                ack_log: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockDialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message accepted by `produce`, in order.
    pub fn produced(&self) -> Vec<Message> {
        lock(&self.inner.state).produced.clone()
    }

    /// Messages produced to the named topic.
    pub fn produced_to(&self, topic: &str) -> Vec<Message> {
        lock(&self.inner.state)
            .produced
            .iter()
            .filter(|m| m.topic.name == topic)
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).subscribers.len()
    }

    /// All acknowledgements recorded so far.
    pub fn acks(&self) -> Vec<Ack> {
        self.drain_acks();
        lock(&self.inner.ack_log).clone()
    }

    /// Block until at least `count` acknowledgements were recorded or
    /// `timeout` elapsed, then return everything recorded.
    pub fn wait_for_acks(&self, count: usize, timeout: Duration) -> Vec<Ack> {
        let deadline = Instant::now() + timeout;
        loop {
            let recorded = self.acks();
            if recorded.len() >= count || self.is_closed() {
                return recorded;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return recorded;
            }

            let next = lock(&self.inner.ack_rx).recv_timeout(remaining.min(Duration::from_millis(20)));
            match next {
                Ok(ack) => self.record(ack),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return self.acks(),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn drain_acks(&self) {
        let pending: Vec<Ack> = lock(&self.inner.ack_rx).try_iter().collect();
        for ack in pending {
            self.record(ack);
        }
    }

    fn record(&self, ack: Ack) {
        // Acks written after close are no-ops.
        if !self.is_closed() {
            lock(&self.inner.ack_log).push(ack);
        }
    }
}

impl Producer for MockDialect {
    fn produce(&self, message: Message) -> Result<(), ProduceError> {
        if self.is_closed() {
            return Err(ProduceError::Closed);
        }
        if !message.topic.produce {
            return Err(ProduceError::NotProducible(message.topic.name.clone()));
        }

        let bytes = self.inner.marshaller.marshal(&message)?;

        let mut state = lock(&self.inner.state);
        state.produced.push(message.clone());

        let topic = message.topic.name.as_str();
        let ack_tx = &self.inner.ack_tx;
        let marshaller = &self.inner.marshaller;
        let mut failure = None;

        // Drop any dead subscribers while delivering.
        state.subscribers.retain_mut(|sub| {
            if !sub.topics.iter().any(|t| t == topic) {
                return true;
            }
            let decoded = match marshaller.unmarshal(&bytes) {
                Ok(decoded) => decoded,
                Err(err) => {
                    failure = Some(err);
                    return true;
                }
            };
            let sequence = sub.next_sequence;
            sub.next_sequence += 1;
            let acker = Acker::new(sub.id, sequence, ack_tx.clone());
            sub.sender.send(Delivery::new(decoded, acker)).is_ok()
        });

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Consumer for MockDialect {
    fn subscribe(&self, topics: &[Topic]) -> Result<Subscription, SubscribeError> {
        if self.is_closed() {
            return Err(SubscribeError::Closed);
        }
        if topics.is_empty() {
            return Err(SubscribeError::NoTopics);
        }
        if let Some(topic) = topics.iter().find(|t| !t.consume) {
            return Err(SubscribeError::NotConsumable(topic.name.clone()));
        }

        let id = SubscriptionId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, subscription) = Subscription::channel(id, topics.to_vec());

        lock(&self.inner.state).subscribers.push(MockSubscriber {
            id,
            topics: topics.iter().map(|t| t.name.clone()).collect(),
            sender,
            next_sequence: 0,
        });

        Ok(subscription)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> Result<(), SubscribeError> {
        let mut state = lock(&self.inner.state);
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != subscription.id());

        if state.subscribers.len() == before {
            return Err(SubscribeError::UnknownSubscription(subscription.id().as_u64()));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), SubscribeError> {
        self.drain_acks();
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.inner.state).subscribers.clear();
        Ok(())
    }
}

impl Dialect for MockDialect {
    fn consumer(&self) -> &dyn Consumer {
        self
    }

    fn producer(&self) -> &dyn Producer {
        self
    }

    fn marshaller(&self) -> &dyn Marshaller {
        &self.inner.marshaller
    }

    fn healthy(&self) -> bool {
        !self.is_closed()
    }
}
