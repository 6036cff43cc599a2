//! Integration tests for the full request/reply pipeline.
//!
//! Tests: Group → Dialect → DeliveryWorker → Middleware → Router → Responder
//!
//! Verifies:
//! - Synchronous calls resolve to the event whose parent is the command id
//! - Every delivery is acked or nacked exactly once
//! - Timeouts and shutdown unblock callers
//! - The log-backed dialect redelivers, dead-letters and commits

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::Context;

    use commander_core::{AckError, ConfigError, DecodeError, StreamKey, SyncError};
    use commander_events::{
        Command, Event, Message, MockDialect, Producer, StatusCode, Topic, TopicKind,
    };

    use crate::config::{GroupConfig, LogDialectConfig};
    use crate::dialect::{Broker, InMemoryLog, LogDialect};
    use crate::group::{Group, GroupBuilder};
    use crate::middleware::{self, Next};
    use crate::responder::Responder;
    use crate::router::Inbound;

    const WIDGET: &[u8] = br#"{"name":"widget"}"#;

    fn config() -> GroupConfig {
        GroupConfig::default().with_timeout(Duration::from_secs(2))
    }

    fn create(responder: &Responder, inbound: Inbound) -> anyhow::Result<()> {
        let command = inbound.as_command().context("expected a command")?;
        responder.produce_event("created", 1, command.key, command.data.clone())?;
        Ok(())
    }

    fn reject(responder: &Responder, _: Inbound) -> anyhow::Result<()> {
        responder.produce_error("creation_failed", br#"{"reason":"out of stock"}"#.to_vec())?;
        Ok(())
    }

    fn example_group(dialect: MockDialect) -> Group {
        GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "example", create)
            .unwrap()
            .start(dialect)
            .unwrap()
    }

    fn example(data: &[u8]) -> Command {
        Command::new("example", 1, StreamKey::new(), data.to_vec())
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn sync_command_returns_the_reply_event() {
        let group = example_group(MockDialect::new());
        let command = example(WIDGET);

        let event = group.sync_command(command.clone()).unwrap();

        assert_eq!(event.parent(), command.id);
        assert_eq!(event.action(), "created");
        assert_eq!(event.key(), command.key);
        assert_eq!(event.data(), WIDGET);
        assert_eq!(event.status(), StatusCode::OK);
        assert_eq!(group.pending_calls(), 0);
        assert!(wait_until(|| group.stats().resolved == 1));
    }

    #[test]
    fn message_without_action_is_nacked_and_not_answered() {
        let dialect = MockDialect::new();
        let group = example_group(dialect.clone());

        let raw = Message::new(Topic::command("commands"), StreamKey::new().to_string(), WIDGET);
        dialect.produce(raw).unwrap();

        let acks = dialect.wait_for_acks(1, Duration::from_secs(2));
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].result, Err(AckError::Decode(DecodeError::MissingAction)));
        assert!(dialect.produced_to("events").is_empty());
        assert_eq!(group.stats().decode_failures, 1);
    }

    #[test]
    fn error_reply_is_returned_as_an_event() {
        let group = GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "example", reject)
            .unwrap()
            .start(MockDialect::new())
            .unwrap();
        let command = example(WIDGET);

        let event = group.sync_command(command.clone()).unwrap();

        assert!(event.is_error());
        assert_eq!(event.status(), StatusCode::INTERNAL_ERROR);
        assert_eq!(event.parent(), command.id);
        assert_eq!(event.key(), command.key);
        assert_eq!(event.action(), "creation_failed");
    }

    #[test]
    fn concurrent_sync_calls_each_get_their_own_reply() {
        let group = example_group(MockDialect::new());

        let callers: Vec<_> = (0..16)
            .map(|i| {
                let group = group.clone();
                thread::spawn(move || {
                    let data = format!(r#"{{"n":{i}}}"#).into_bytes();
                    let command = example(&data);
                    let event = group.sync_command(command.clone()).unwrap();
                    (command, event)
                })
            })
            .collect();

        for caller in callers {
            let (command, event) = caller.join().unwrap();
            assert_eq!(event.parent(), command.id);
            assert_eq!(event.data(), command.data.as_slice());
        }
        assert_eq!(group.pending_calls(), 0);
    }

    #[test]
    fn unanswered_call_times_out_close_to_the_deadline() {
        let group = example_group(MockDialect::new());
        let command = Command::new("unrouted", 1, StreamKey::new(), Vec::new());

        let started = Instant::now();
        let err = group
            .sync_command_timeout(command.clone(), Duration::from_millis(100))
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(
            err,
            SyncError::Timeout {
                id: command.id,
                after: Duration::from_millis(100)
            }
        );
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
        assert_eq!(group.stats().timed_out, 1);
    }

    #[test]
    fn every_delivery_is_settled_exactly_once() {
        let dialect = MockDialect::new();
        let group = GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "flaky", |_: &Responder, inbound: Inbound| -> anyhow::Result<()> {
                let command = inbound.as_command().context("expected a command")?;
                match command.data.as_slice() {
                    b"\"panic\"" => panic!("handler blew up"),
                    b"\"fail\"" => anyhow::bail!("refused"),
                    _ => Ok(()),
                }
            })
            .unwrap()
            .start(dialect.clone())
            .unwrap();

        let payloads = ["\"ok\"", "\"fail\"", "\"panic\"", "\"ok\"", "\"fail\""];
        for payload in payloads {
            let command = Command::new("flaky", 1, StreamKey::new(), payload.as_bytes().to_vec());
            group.async_command(&command).unwrap();
        }

        let acks = dialect.wait_for_acks(payloads.len(), Duration::from_secs(2));
        thread::sleep(Duration::from_millis(50));
        let acks_after = dialect.acks();
        assert_eq!(acks.len(), payloads.len());
        assert_eq!(acks_after.len(), payloads.len());

        let unique: HashSet<_> = acks_after.iter().map(|a| (a.subscription, a.sequence)).collect();
        assert_eq!(unique.len(), payloads.len());
        assert_eq!(acks_after.iter().filter(|a| a.result.is_ok()).count(), 2);
        assert!(
            acks_after
                .iter()
                .any(|a| matches!(&a.result, Err(AckError::Panicked(msg)) if msg == "handler blew up"))
        );
        assert_eq!(group.stats().handler_failures, 3);
    }

    #[test]
    fn every_subscriber_receives_the_message() {
        let dialect = MockDialect::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let start = |seen: Arc<AtomicUsize>| {
            GroupBuilder::new(config())
                .handle_func(TopicKind::Command, "broadcast", move |_: &Responder, _: Inbound| -> anyhow::Result<()> {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
                .start(dialect.clone())
                .unwrap()
        };
        let first = start(Arc::clone(&seen));
        let _second = start(Arc::clone(&seen));

        let command = Command::new("broadcast", 1, StreamKey::new(), Vec::new());
        first.async_command(&command).unwrap();

        let acks = dialect.wait_for_acks(2, Duration::from_secs(2));
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| a.result.is_ok()));
        assert_ne!(acks[0].subscription, acks[1].subscription);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_handler_is_a_config_error() {
        let err = GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "example", create)
            .unwrap()
            .handle_func(TopicKind::Command, "example", reject)
            .unwrap_err();

        assert_eq!(
            err,
            ConfigError::DuplicateHandler {
                kind: "command",
                action: "example".to_string()
            }
        );
    }

    #[test]
    fn close_unblocks_pending_calls() {
        let group = example_group(MockDialect::new());
        let waiter = group
            .begin_sync(Command::new("unrouted", 1, StreamKey::new(), Vec::new()))
            .unwrap();

        let blocked = thread::spawn(move || waiter.wait(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        group.close().unwrap();

        assert_eq!(blocked.join().unwrap(), Err(SyncError::Closed));
        assert_eq!(group.pending_calls(), 0);
    }

    #[test]
    fn middleware_wraps_handlers_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str, calls: &Arc<Mutex<Vec<String>>>| {
            let calls = Arc::clone(calls);
            move |next: Next| -> Next {
                let calls = Arc::clone(&calls);
                Arc::new(move |responder: &Responder, inbound: Inbound| -> anyhow::Result<()> {
                    calls.lock().unwrap().push(format!("{name}:{}", inbound.action()));
                    if inbound.action() == "blocked" {
                        return Ok(());
                    }
                    next(responder, inbound)
                })
            }
        };

        let dialect = MockDialect::new();
        let group = GroupBuilder::new(config())
            .use_middleware(middleware::trace())
            .use_middleware(record("outer", &calls))
            .use_middleware(record("inner", &calls))
            .handle_func(TopicKind::Command, "example", create)
            .unwrap()
            .handle_func(TopicKind::Command, "blocked", create)
            .unwrap()
            .start(dialect.clone())
            .unwrap();

        group.sync_command(example(WIDGET)).unwrap();
        group
            .async_command(&Command::new("blocked", 1, StreamKey::new(), Vec::new()))
            .unwrap();
        assert!(wait_until(|| calls.lock().unwrap().iter().any(|c| c == "outer:blocked")));

        let calls = calls.lock().unwrap().clone();
        let commands: Vec<_> = calls.iter().filter(|c| !c.ends_with(":created")).cloned().collect();
        assert_eq!(commands, ["outer:example", "inner:example", "outer:blocked"]);
        // The short-circuited command was acked but never answered.
        assert_eq!(dialect.produced_to("events").len(), 1);
    }

    #[test]
    fn event_handlers_can_issue_follow_up_commands() {
        let dialect = MockDialect::new();
        let group = GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "example", create)
            .unwrap()
            .handle_func(TopicKind::Event, "created", |responder: &Responder, inbound: Inbound| -> anyhow::Result<()> {
                let event = inbound.as_event().context("expected an event")?;
                responder.produce_command("notify", 1, event.key(), Vec::new())?;
                Ok(())
            })
            .unwrap()
            .start(dialect.clone())
            .unwrap();

        let command = example(WIDGET);
        group.sync_command(command.clone()).unwrap();

        assert!(wait_until(|| dialect.produced_to("commands").len() == 2));
        let follow_up = Command::populate(&dialect.produced_to("commands")[1])
            .unwrap()
            .into_strict()
            .unwrap();
        assert_eq!(follow_up.action, "notify");
        assert_eq!(follow_up.key, command.key);
    }

    fn log_config() -> LogDialectConfig {
        LogDialectConfig {
            poll_wait: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(1),
            max_retries: 2,
            ..LogDialectConfig::default()
        }
    }

    fn committed(log: &InMemoryLog, topic: &str) -> u64 {
        (0..log.partitions(topic).unwrap())
            .filter_map(|p| log.committed("commander", topic, p).unwrap())
            .sum()
    }

    #[test]
    fn sync_round_trip_over_the_log_dialect() {
        let log = Arc::new(InMemoryLog::new(3));
        let group = GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "example", create)
            .unwrap()
            .start(LogDialect::new(Arc::clone(&log), log_config()))
            .unwrap();

        let command = example(WIDGET);
        let event = group.sync_command(command.clone()).unwrap();

        assert_eq!(event.parent(), command.id);
        assert_eq!(event.data(), WIDGET);
        assert!(wait_until(|| committed(&log, "commands") == 1));
        assert!(wait_until(|| committed(&log, "events") == 1));
        assert!(group.healthy());

        group.close().unwrap();
        assert!(!group.healthy());
    }

    #[test]
    fn failing_handler_is_retried_then_dead_lettered() {
        let log = Arc::new(InMemoryLog::new(1));
        let dialect = Arc::new(LogDialect::new(Arc::clone(&log), log_config()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let group = GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "poison", move |_: &Responder, _: Inbound| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("cannot process")
            })
            .unwrap()
            .start(Arc::clone(&dialect))
            .unwrap();

        let command = Command::new("poison", 1, StreamKey::new(), Vec::new());
        group.async_command(&command).unwrap();

        assert!(wait_until(|| log.len("commands.dlq") == 1));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(dialect.redeliveries(), 2);
        assert!(wait_until(|| committed(&log, "commands") == 1));

        let dead = &log.records("commands.dlq")[0];
        let dead_command = Command::populate(&Message {
            topic: Topic::command("commands.dlq"),
            key: dead.key.clone(),
            value: dead.value.clone(),
            headers: dead.headers.clone(),
        })
        .unwrap()
        .into_strict()
        .unwrap();
        assert_eq!(dead_command.id, command.id);
        assert_eq!(group.stats().handler_failures, 3);
    }

    #[test]
    fn replies_resolve_across_groups_sharing_a_log() {
        let log = Arc::new(InMemoryLog::new(2));
        let service = GroupBuilder::new(config())
            .handle_func(TopicKind::Command, "example", create)
            .unwrap()
            .start(LogDialect::new(
                Arc::clone(&log),
                LogDialectConfig {
                    consumer_group: "service".to_string(),
                    ..log_config()
                },
            ))
            .unwrap();
        let client = GroupBuilder::new(GroupConfig::new(vec![
            Topic::command("commands").with_consume(false),
            Topic::event("events"),
        ]))
        .start(LogDialect::new(
            Arc::clone(&log),
            LogDialectConfig {
                consumer_group: "client".to_string(),
                ..log_config()
            },
        ))
        .unwrap();

        let command = example(WIDGET);
        let event: Event = client.sync_command(command.clone()).unwrap();

        assert_eq!(event.parent(), command.id);
        assert!(wait_until(|| service.stats().handled == 1));
        assert!(wait_until(|| client.stats().resolved == 1));
    }
}
