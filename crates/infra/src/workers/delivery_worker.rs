use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use commander_core::{AckError, DecodeError};
use commander_events::{Command, Delivery, Event, Message, Subscription, TopicKind};

use crate::correlation::PendingCalls;
use crate::middleware::Next;
use crate::responder::{Outbound, Responder};
use crate::router::Inbound;
use crate::stats::{Counter, GroupStats};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop after the delivery it is processing.
    pub fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the worker thread to exit. A worker joining itself (a handler
    /// closing its own group) returns immediately.
    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            if j.thread().id() != thread::current().id() {
                let _ = j.join();
            }
        }
    }
}

/// Everything a worker needs to process one delivery.
pub struct WorkerContext {
    /// Middleware composed around the router.
    pub chain: Next,
    pub outbound: Arc<Outbound>,
    pub pending: Arc<PendingCalls>,
    pub stats: Arc<GroupStats>,
    pub strict_decoding: bool,
}

/// Delivery loop for one subscription.
///
/// - Decodes each message by the kind of the topic it came from
/// - Offers events to the pending-call table, then routes everything
/// - Acks or nacks every delivery exactly once; undecodable messages, handler
///   errors and handler panics are nacked and the loop keeps going
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct DeliveryWorker;

impl DeliveryWorker {
    pub fn spawn(
        name: String,
        subscription: Subscription,
        ctx: Arc<WorkerContext>,
    ) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&thread_name, subscription, shutdown_rx, &ctx))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop(
    name: &str,
    subscription: Subscription,
    shutdown_rx: mpsc::Receiver<()>,
    ctx: &WorkerContext,
) {
    let tick = Duration::from_millis(100);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(tick) {
            Ok(delivery) => process(ctx, delivery),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = name, subscription = %subscription.id(), "delivery worker stopped");
}

/// Decode, correlate, dispatch and acknowledge one delivery.
pub fn process(ctx: &WorkerContext, delivery: Delivery) {
    let (message, acker) = delivery.into_parts();

    let inbound = match decode(&message, ctx.strict_decoding) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!(topic = %message.topic.name, error = %err, "dropping undecodable message");
            ctx.stats.incr(Counter::DecodeFailures);
            acker.settle(Err(AckError::Decode(err)));
            return;
        }
    };

    if let Inbound::Event(event) = &inbound {
        if ctx.pending.resolve(event) {
            debug!(parent = %event.parent(), action = event.action(), "resolved pending call");
            ctx.stats.incr(Counter::Resolved);
        }
    }

    let responder = Responder::for_inbound(Arc::clone(&ctx.outbound), &inbound);
    let kind = inbound.kind();
    let id = inbound.id();

    let result = panic::catch_unwind(AssertUnwindSafe(|| (ctx.chain)(&responder, inbound)));

    let ack = match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            let reason = format!("{err:#}");
            warn!(%kind, %id, error = %reason, "handler failed");
            ctx.stats.incr(Counter::HandlerFailures);
            Err(AckError::Handler(reason))
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(%kind, %id, panic = %reason, "handler panicked");
            ctx.stats.incr(Counter::HandlerFailures);
            Err(AckError::Panicked(reason))
        }
    };

    acker.settle(ack);
}

fn decode(message: &Message, strict: bool) -> Result<Inbound, DecodeError> {
    match message.topic.kind {
        TopicKind::Command => {
            let populated = Command::populate(message)?;
            let command = if strict {
                populated.into_strict()?
            } else {
                populated.into_lenient()
            };
            Ok(Inbound::Command(command))
        }
        TopicKind::Event => {
            let populated = Event::populate(message)?;
            let event = if strict {
                populated.into_strict()?
            } else {
                populated.into_lenient()
            };
            Ok(Inbound::Event(event))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use commander_core::{CommandId, StreamKey};
    use commander_events::{Ack, Consumer, MockDialect, Producer, Topic};

    fn context(dialect: &MockDialect, chain: Next, strict: bool) -> WorkerContext {
        WorkerContext {
            chain,
            outbound: Arc::new(Outbound::new(
                Arc::new(dialect.clone()),
                vec![Topic::command("commands"), Topic::event("events")],
            )),
            pending: Arc::new(PendingCalls::new()),
            stats: Arc::new(GroupStats::new()),
            strict_decoding: strict,
        }
    }

    fn chain(f: impl Fn(&Responder, Inbound) -> anyhow::Result<()> + Send + Sync + 'static) -> Next {
        Arc::new(f)
    }

    fn deliver(dialect: &MockDialect, topic: Topic, message: Message) -> Delivery {
        let sub = dialect.subscribe(&[topic]).unwrap();
        dialect.produce(message).unwrap();
        let delivery = sub.try_recv().unwrap();
        dialect.unsubscribe(&sub).unwrap();
        delivery
    }

    fn single_ack(dialect: &MockDialect) -> Ack {
        let acks = dialect.acks();
        assert_eq!(acks.len(), 1, "expected exactly one ack, got {acks:?}");
        acks.into_iter().next().unwrap()
    }

    #[test]
    fn successful_handler_acks() {
        let dialect = MockDialect::new();
        let ctx = context(&dialect, chain(|_, _| Ok(())), false);
        let command = Command::new("example", 1, StreamKey::new(), Vec::new());
        let topic = Topic::command("commands");

        process(&ctx, deliver(&dialect, topic.clone(), command.to_message(&topic).unwrap()));

        assert_eq!(single_ack(&dialect).result, Ok(()));
    }

    #[test]
    fn missing_action_is_nacked_without_dispatch() {
        let dialect = MockDialect::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let ctx = context(
            &dialect,
            chain(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            false,
        );
        let topic = Topic::command("commands");
        let message = Message::new(topic.clone(), StreamKey::new().to_string(), "null");

        process(&ctx, deliver(&dialect, topic, message));

        assert_eq!(
            single_ack(&dialect).result,
            Err(AckError::Decode(DecodeError::MissingAction))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.stats.snapshot().decode_failures, 1);
        assert!(dialect.produced_to("events").is_empty());
    }

    #[test]
    fn strict_decoding_nacks_soft_field_errors() {
        let topic = Topic::command("commands");
        let message = Message::new(topic.clone(), "not-a-uuid", "null").with_header("action", "example");

        let lenient = MockDialect::new();
        let ctx = context(&lenient, chain(|_, _| Ok(())), false);
        process(&ctx, deliver(&lenient, topic.clone(), message.clone()));
        assert_eq!(single_ack(&lenient).result, Ok(()));

        let strict = MockDialect::new();
        let ctx = context(&strict, chain(|_, _| Ok(())), true);
        process(&ctx, deliver(&strict, topic, message));
        assert!(matches!(
            single_ack(&strict).result,
            Err(AckError::Decode(DecodeError::InvalidFields(_)))
        ));
    }

    #[test]
    fn handler_errors_and_panics_are_nacked() {
        let dialect = MockDialect::new();
        let ctx = context(
            &dialect,
            chain(|_, inbound| {
                if inbound.action() == "explode" {
                    panic!("kaboom");
                }
                Err(anyhow::anyhow!("rejected").context("validating order"))
            }),
            false,
        );
        let topic = Topic::command("commands");
        let failing = Command::new("reject", 1, StreamKey::new(), Vec::new());
        let panicking = Command::new("explode", 1, StreamKey::new(), Vec::new());

        process(&ctx, deliver(&dialect, topic.clone(), failing.to_message(&topic).unwrap()));
        process(&ctx, deliver(&dialect, topic.clone(), panicking.to_message(&topic).unwrap()));

        let acks = dialect.acks();
        assert_eq!(acks.len(), 2);
        assert_eq!(
            acks[0].result,
            Err(AckError::Handler("validating order: rejected".to_string()))
        );
        assert_eq!(acks[1].result, Err(AckError::Panicked("kaboom".to_string())));
        assert_eq!(ctx.stats.snapshot().handler_failures, 2);
    }

    #[test]
    fn events_resolve_pending_calls_and_are_still_dispatched() {
        let dialect = MockDialect::new();
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);
        let ctx = context(
            &dialect,
            chain(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            false,
        );

        let id = CommandId::new();
        let waiter = ctx.pending.register(id).unwrap();
        let event = Event::new("created", 1, id, StreamKey::new(), Vec::new());
        let topic = Topic::event("events");

        process(&ctx, deliver(&dialect, topic.clone(), event.to_message(&topic).unwrap()));

        assert_eq!(waiter.wait(Duration::from_secs(1)).unwrap().id(), event.id());
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.stats.snapshot().resolved, 1);
        assert_eq!(single_ack(&dialect).result, Ok(()));
    }

    #[test]
    fn worker_stops_on_shutdown() {
        let dialect = MockDialect::new();
        let ctx = Arc::new(context(&dialect, chain(|_, _| Ok(())), false));
        let sub = dialect.subscribe(&[Topic::command("commands")]).unwrap();

        let handle = DeliveryWorker::spawn("test-worker".to_string(), sub, ctx).unwrap();
        assert_eq!(handle.name(), "test-worker");
        handle.signal();
        handle.join();
    }
}
