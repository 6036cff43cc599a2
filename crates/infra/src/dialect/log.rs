//! Dialect over a partitioned, append-only log.
//!
//! ## Delivery
//!
//! Each subscribed topic gets one pump thread that reads the log from the
//! consumer group's committed position and, record by record:
//!
//! 1. hands a [`Delivery`] to every local subscriber of the topic (fan-out)
//! 2. waits until each of them acked or nacked it
//! 3. redelivers to the subscribers that nacked, with exponential backoff,
//!    up to `max_retries` times
//! 4. dead-letters the record to `<topic><dead_letter_suffix>` when retries
//!    are exhausted or the failure is not retryable (decode errors)
//! 5. commits the position
//!
//! A record fetched while the topic has no subscriber left is neither
//! delivered nor committed; it is fetched again once someone subscribes.
//!
//! The next record of a topic is only delivered once the previous one was
//! settled, so acks advance the committed position strictly in order.
//! Positions are committed only after step 5: a crash or close before that
//! redelivers the record on the next start (at-least-once).
//!
//! Records carry key, value and headers natively; the marshaller is exposed
//! for callers that need to ship messages as opaque bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use commander_core::{AckError, ProduceError, SubscribeError};
use commander_events::{
    Ack, Acker, Consumer, Delivery, Dialect, Header, JsonMarshaller, Marshaller, Message,
    Producer, Subscription, SubscriptionId, Topic,
};

use super::broker::{Broker, BrokerError, Cursor, FetchedRecord, Record};
use crate::config::LogDialectConfig;

pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";
pub const ORIGINAL_POSITION_HEADER: &str = "x-original-position";
pub const FAILED_AT_HEADER: &str = "x-failed-at";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One subscription's presence on one topic.
#[derive(Debug)]
struct LocalSubscriber {
    id: SubscriptionId,
    topic: Topic,
    deliveries: Sender<Delivery>,
    ack_tx: Sender<Ack>,
    acks: Mutex<Receiver<Ack>>,
    /// Shared by all topics of the subscription.
    next_sequence: Arc<AtomicU64>,
    detached: AtomicBool,
}

enum AckWait {
    Settled(Result<(), AckError>),
    Gone,
    Shutdown,
}

enum RecordOutcome {
    Delivered,
    /// Nobody was left to take the record; it stays uncommitted.
    NoSubscribers,
    DeadLettered,
    Shutdown,
}

struct LogInner<B> {
    broker: B,
    config: LogDialectConfig,
    marshaller: JsonMarshaller,
    subscribers: Mutex<HashMap<String, Vec<Arc<LocalSubscriber>>>>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    redeliveries: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Log-backed dialect. Share it by wrapping it in an `Arc`; dropping it
/// closes it.
pub struct LogDialect<B: Broker + 'static> {
    inner: Arc<LogInner<B>>,
}

impl<B: Broker + 'static> core::fmt::Debug for LogDialect<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogDialect")
            .field("config", &self.inner.config)
            .field("closed", &self.inner.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl<B: Broker + 'static> LogDialect<B> {
    pub fn new(broker: B, config: LogDialectConfig) -> Self {
        Self {
            inner: Arc::new(LogInner {
                broker,
                config,
                marshaller: JsonMarshaller,
                subscribers: Mutex::new(HashMap::new()),
                pumps: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
                redeliveries: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
            }),
        }
    }

    pub fn broker(&self) -> &B {
        &self.inner.broker
    }

    pub fn config(&self) -> &LogDialectConfig {
        &self.inner.config
    }

    /// Deliveries repeated after a nack.
    pub fn redeliveries(&self) -> u64 {
        self.inner.redeliveries.load(Ordering::Relaxed)
    }

    /// Records moved to a dead-letter topic.
    pub fn dead_lettered(&self) -> u64 {
        self.inner.dead_lettered.load(Ordering::Relaxed)
    }
}

impl<B: Broker + 'static> Drop for LogDialect<B> {
    fn drop(&mut self) {
        let _ = self.inner.close();
    }
}

impl<B: Broker + 'static> Producer for LogDialect<B> {
    fn produce(&self, message: Message) -> Result<(), ProduceError> {
        if self.inner.is_shutdown() {
            return Err(ProduceError::Closed);
        }
        if !message.topic.produce {
            return Err(ProduceError::NotProducible(message.topic.name));
        }

        let record = Record {
            topic: message.topic.name,
            key: message.key,
            value: message.value,
            headers: message.headers,
        };
        self.inner
            .broker
            .produce(record)
            .map(|_| ())
            .map_err(|err| match err {
                BrokerError::Closed => ProduceError::Closed,
                other => ProduceError::Rejected(other.to_string()),
            })
    }
}

impl<B: Broker + 'static> Consumer for LogDialect<B> {
    fn subscribe(&self, topics: &[Topic]) -> Result<Subscription, SubscribeError> {
        if self.inner.is_shutdown() {
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
        let next_sequence = Arc::new(AtomicU64::new(0));

        for topic in topics {
            let (ack_tx, ack_rx) = mpsc::channel();
            let local = Arc::new(LocalSubscriber {
                id,
                topic: topic.clone(),
                deliveries: sender.clone(),
                ack_tx,
                acks: Mutex::new(ack_rx),
                next_sequence: Arc::clone(&next_sequence),
                detached: AtomicBool::new(false),
            });
            lock(&self.inner.subscribers)
                .entry(topic.name.clone())
                .or_default()
                .push(local);
            LogInner::ensure_pump(&self.inner, &topic.name)?;
        }

        debug!(subscription = %id, topics = topics.len(), "subscribed");
        Ok(subscription)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> Result<(), SubscribeError> {
        let id = subscription.id();
        let mut removed = 0;
        for locals in lock(&self.inner.subscribers).values_mut() {
            locals.retain(|local| {
                if local.id == id {
                    local.detached.store(true, Ordering::SeqCst);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }

        if removed == 0 {
            return Err(SubscribeError::UnknownSubscription(id.as_u64()));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), SubscribeError> {
        self.inner.close()
    }
}

impl<B: Broker + 'static> Dialect for LogDialect<B> {
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
        !self.inner.is_shutdown()
    }
}

impl<B: Broker + 'static> LogInner<B> {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn ensure_pump(this: &Arc<Self>, topic: &str) -> Result<(), SubscribeError> {
        let mut pumps = lock(&this.pumps);
        if pumps.contains_key(topic) {
            return Ok(());
        }

        let inner = Arc::clone(this);
        let name = topic.to_string();
        let handle = thread::Builder::new()
            .name(format!("commander-log-{topic}"))
            .spawn(move || inner.pump(&name))
            .map_err(|e| SubscribeError::Broker(e.to_string()))?;
        pumps.insert(topic.to_string(), handle);
        Ok(())
    }

    fn close(&self) -> Result<(), SubscribeError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for local in lock(&self.subscribers).drain().flat_map(|(_, locals)| locals) {
            local.detached.store(true, Ordering::SeqCst);
        }

        let pumps: Vec<JoinHandle<()>> = lock(&self.pumps).drain().map(|(_, h)| h).collect();
        for pump in pumps {
            if pump.thread().id() != thread::current().id() {
                let _ = pump.join();
            }
        }

        info!(group = %self.config.consumer_group, "log dialect closed");
        Ok(())
    }

    fn subscribers_of(&self, topic: &str) -> Vec<Arc<LocalSubscriber>> {
        lock(&self.subscribers)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Sleep for `duration` unless shutdown starts first. Returns `false` on
    /// shutdown.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let step = self.config.poll_wait.max(Duration::from_millis(1));
        loop {
            if self.is_shutdown() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(step));
        }
    }

    fn initial_cursor(&self, topic: &str) -> Result<Cursor, BrokerError> {
        let group = &self.config.consumer_group;
        let mut cursor = Cursor::new();
        for partition in 0..self.broker.partitions(topic)? {
            let next = self.broker.committed(group, topic, partition)?.unwrap_or(0);
            cursor.insert(partition, next);
        }
        Ok(cursor)
    }

    fn pump(&self, topic: &str) {
        let mut cursor = loop {
            match self.initial_cursor(topic) {
                Ok(cursor) => break cursor,
                Err(BrokerError::Closed) => return,
                Err(err) => {
                    warn!(%topic, error = %err, "cannot read committed offsets");
                    if !self.pause(self.config.poll_wait) {
                        return;
                    }
                }
            }
        };
        debug!(%topic, ?cursor, "log pump started");

        while !self.is_shutdown() {
            if self.subscribers_of(topic).is_empty() {
                if !self.pause(self.config.poll_wait) {
                    break;
                }
                continue;
            }

            let batch = match self.broker.fetch(
                topic,
                &cursor,
                self.config.max_batch,
                self.config.poll_wait,
            ) {
                Ok(batch) => batch,
                Err(BrokerError::Closed) => break,
                Err(err) => {
                    warn!(%topic, error = %err, "fetch failed");
                    if !self.pause(self.config.poll_wait) {
                        break;
                    }
                    continue;
                }
            };

            for fetched in batch {
                match self.process_record(&fetched) {
                    RecordOutcome::Delivered | RecordOutcome::DeadLettered => {}
                    // Refetch from the same cursor once someone subscribes.
                    RecordOutcome::NoSubscribers => break,
                    RecordOutcome::Shutdown => return,
                }

                let position = &fetched.position;
                if let Err(err) = self.broker.commit(&self.config.consumer_group, position) {
                    warn!(%topic, partition = position.partition, offset = position.offset, error = %err, "commit failed");
                }
                cursor.insert(position.partition, position.offset + 1);
            }
        }

        debug!(%topic, "log pump stopped");
    }

    fn process_record(&self, fetched: &FetchedRecord) -> RecordOutcome {
        let mut targets = self.subscribers_of(&fetched.record.topic);
        let mut attempt: u32 = 0;
        let mut acked = false;

        loop {
            let mut sent = Vec::with_capacity(targets.len());
            for local in &targets {
                let sequence = local.next_sequence.fetch_add(1, Ordering::SeqCst);
                let message = Message {
                    topic: local.topic.clone(),
                    key: fetched.record.key.clone(),
                    value: fetched.record.value.clone(),
                    headers: fetched.record.headers.clone(),
                };
                let acker = Acker::new(local.id, sequence, local.ack_tx.clone());
                if local.deliveries.send(Delivery::new(message, acker)).is_ok() {
                    sent.push((Arc::clone(local), sequence));
                } else {
                    // Subscription dropped without unsubscribing.
                    self.detach(local);
                }
            }

            let mut failed = Vec::new();
            for (local, sequence) in sent {
                match self.await_ack(&local, sequence) {
                    AckWait::Settled(Ok(())) => acked = true,
                    AckWait::Gone => {}
                    AckWait::Settled(Err(err)) => failed.push((local, err)),
                    AckWait::Shutdown => return RecordOutcome::Shutdown,
                }
            }

            let Some((_, last_error)) = failed.last() else {
                return if acked {
                    RecordOutcome::Delivered
                } else {
                    RecordOutcome::NoSubscribers
                };
            };

            let retryable = failed.iter().all(|(_, err)| err.is_retryable());
            if !retryable || attempt >= self.config.max_retries {
                let reason = last_error.to_string();
                return self.dead_letter(fetched, &reason, attempt);
            }

            attempt += 1;
            self.redeliveries.fetch_add(failed.len() as u64, Ordering::Relaxed);
            debug!(
                topic = %fetched.position.topic,
                partition = fetched.position.partition,
                offset = fetched.position.offset,
                attempt,
                error = %last_error,
                "redelivering nacked record"
            );
            if !self.pause(self.config.backoff(attempt)) {
                return RecordOutcome::Shutdown;
            }
            targets = failed.into_iter().map(|(local, _)| local).collect();
        }
    }

    fn await_ack(&self, local: &LocalSubscriber, sequence: u64) -> AckWait {
        let acks = lock(&local.acks);
        loop {
            if self.is_shutdown() {
                return AckWait::Shutdown;
            }
            if local.detached.load(Ordering::SeqCst) {
                return AckWait::Gone;
            }

            match acks.recv_timeout(self.config.poll_wait) {
                Ok(ack) if ack.sequence == sequence => return AckWait::Settled(ack.result),
                // Stale ack from a delivery given up on earlier.
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return AckWait::Gone,
            }
        }
    }

    fn detach(&self, local: &Arc<LocalSubscriber>) {
        local.detached.store(true, Ordering::SeqCst);
        if let Some(locals) = lock(&self.subscribers).get_mut(&local.topic.name) {
            locals.retain(|other| !Arc::ptr_eq(other, local));
        }
    }

    fn dead_letter(&self, fetched: &FetchedRecord, reason: &str, retries: u32) -> RecordOutcome {
        let position = &fetched.position;
        let mut headers = fetched.record.headers.clone();
        headers.push(Header::new(DEAD_LETTER_REASON_HEADER, reason.as_bytes().to_vec()));
        headers.push(Header::new(RETRY_COUNT_HEADER, retries.to_string().into_bytes()));
        headers.push(Header::new(ORIGINAL_TOPIC_HEADER, position.topic.as_bytes().to_vec()));
        headers.push(Header::new(
            ORIGINAL_POSITION_HEADER,
            format!("{}:{}", position.partition, position.offset).into_bytes(),
        ));
        headers.push(Header::new(FAILED_AT_HEADER, Utc::now().to_rfc3339().into_bytes()));

        let record = Record {
            topic: self.config.dead_letter_topic(&position.topic),
            key: fetched.record.key.clone(),
            value: fetched.record.value.clone(),
            headers,
        };

        let mut attempt: u32 = 0;
        loop {
            match self.broker.produce(record.clone()) {
                Ok(dlq) => {
                    self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = %position.topic,
                        partition = position.partition,
                        offset = position.offset,
                        dead_letter_topic = %dlq.topic,
                        retry_count = retries,
                        reason,
                        "record sent to dead-letter topic"
                    );
                    return RecordOutcome::DeadLettered;
                }
                Err(err) => {
                    // Never commit past a record that is neither processed
                    // nor dead-lettered.
                    attempt += 1;
                    error!(topic = %position.topic, error = %err, attempt, "dead-letter write failed");
                    if !self.pause(self.config.backoff(attempt)) {
                        return RecordOutcome::Shutdown;
                    }
                }
            }
        }
    }
}
