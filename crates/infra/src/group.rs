//! Group lifecycle and the synchronous call entry points.
//!
//! ## Flow
//!
//! ```text
//! GroupBuilder (topics, routes, middleware)
//!   ↓ start(dialect)
//! 1. Validate config, freeze the route table, compose middleware
//!   ↓
//! 2. One subscription + delivery worker per consumable topic
//!   ↓
//! Group
//!   - sync_command: register waiter → produce → wait (reply | timeout | close)
//!   - async_command / produce_event: produce only
//!   - close: fail pending calls → stop workers → close dialect
//! ```
//!
//! The pending-call table is owned by the group and shared only with its own
//! workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use commander_core::{ConfigError, ProduceError, SubscribeError, SyncError};
use commander_events::{Command, Dialect, Event, TopicKind};

use crate::config::GroupConfig;
use crate::correlation::{PendingCalls, Waiter};
use crate::middleware::{self, Middleware, Next};
use crate::responder::{Outbound, Responder};
use crate::router::{Dispatch, Handler, Inbound, Router};
use crate::stats::{Counter, GroupStats, StatsSnapshot};
use crate::workers::{DeliveryWorker, WorkerContext, WorkerHandle};

#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("subscribe failed: {0}")]
    Subscribe(#[from] SubscribeError),

    #[error("failed to spawn delivery worker: {0}")]
    Spawn(String),
}

/// Collects routes and middleware before any subscription exists.
pub struct GroupBuilder {
    config: GroupConfig,
    router: Router,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl core::fmt::Debug for GroupBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GroupBuilder")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl GroupBuilder {
    pub fn new(config: GroupConfig) -> Self {
        Self {
            config,
            router: Router::new(),
            middleware: Vec::new(),
        }
    }

    /// Register the handler for `(kind, action)`.
    pub fn handle_func(
        mut self,
        kind: TopicKind,
        action: impl Into<String>,
        handler: impl Handler,
    ) -> Result<Self, ConfigError> {
        self.router.handle_func(kind, action, handler)?;
        Ok(self)
    }

    /// Append a middleware; earlier registrations wrap later ones.
    pub fn use_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Subscribe to every consumable topic and start delivering.
    pub fn start(self, dialect: impl Dialect + 'static) -> Result<Group, GroupError> {
        self.config.validate()?;

        let dialect: Arc<dyn Dialect> = Arc::new(dialect);
        let stats = Arc::new(GroupStats::new());
        let pending = Arc::new(PendingCalls::new());
        let outbound = Arc::new(Outbound::new(
            Arc::clone(&dialect),
            self.config.topics.clone(),
        ));

        let router = Arc::new(self.router);
        let endpoint: Next = {
            let stats = Arc::clone(&stats);
            Arc::new(move |responder: &Responder, inbound: Inbound| -> anyhow::Result<()> {
                match router.dispatch(responder, inbound)? {
                    Dispatch::Handled => stats.incr(Counter::Handled),
                    Dispatch::Unhandled => stats.incr(Counter::Unhandled),
                }
                Ok(())
            })
        };

        let ctx = Arc::new(WorkerContext {
            chain: middleware::compose(&self.middleware, endpoint),
            outbound: Arc::clone(&outbound),
            pending: Arc::clone(&pending),
            stats: Arc::clone(&stats),
            strict_decoding: self.config.strict_decoding,
        });

        let group = Group {
            inner: Arc::new(GroupInner {
                config: self.config,
                dialect,
                outbound,
                pending,
                stats,
                workers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };

        // On error `group` is dropped here, which stops the workers started
        // so far.
        for topic in group.inner.config.consumable() {
            let subscription = group
                .inner
                .dialect
                .consumer()
                .subscribe(std::slice::from_ref(topic))?;
            let worker = DeliveryWorker::spawn(
                format!("commander-{}", topic.name),
                subscription,
                Arc::clone(&ctx),
            )
            .map_err(|e| GroupError::Spawn(e.to_string()))?;
            group.inner.workers().push(worker);
        }

        info!(
            topics = ?group.inner.config.topics.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            timeout_ms = group.inner.config.timeout.as_millis() as u64,
            "group started"
        );
        Ok(group)
    }
}

struct GroupInner {
    config: GroupConfig,
    dialect: Arc<dyn Dialect>,
    outbound: Arc<Outbound>,
    pending: Arc<PendingCalls>,
    stats: Arc<GroupStats>,
    workers: Mutex<Vec<WorkerHandle>>,
    closed: AtomicBool,
}

impl GroupInner {
    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) -> Result<(), SubscribeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let unblocked = self.pending.close();
        let workers = std::mem::take(&mut *self.workers());
        for worker in &workers {
            worker.signal();
        }
        let result = self.dialect.close();
        for worker in workers {
            let name = worker.name().to_string();
            worker.join();
            debug!(worker = %name, "delivery worker joined");
        }

        if let Err(err) = &result {
            warn!(error = %err, "dialect close failed");
        }
        info!(unblocked, "group closed");
        result
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A running group. Clones share the same subscriptions and pending calls.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl core::fmt::Debug for Group {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Group")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Group {
    pub fn builder(config: GroupConfig) -> GroupBuilder {
        GroupBuilder::new(config)
    }

    pub fn config(&self) -> &GroupConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of synchronous calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn healthy(&self) -> bool {
        !self.is_closed() && self.inner.dialect.healthy()
    }

    /// Produce `command` and block until its reply arrives or the group's
    /// timeout elapses.
    ///
    /// A reply with an error status is returned as `Ok`; check
    /// [`Event::is_error`].
    pub fn sync_command(&self, command: Command) -> Result<Event, SyncError> {
        self.sync_command_timeout(command, self.inner.config.timeout)
    }

    #[instrument(skip(self, command), fields(action = %command.action, id = %command.id))]
    pub fn sync_command_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Event, SyncError> {
        let result = self.begin_sync(command)?.wait(timeout);
        match &result {
            Ok(event) => debug!(status = %event.status(), "sync call resolved"),
            Err(err) if err.is_timeout() => {
                self.inner.stats.incr(Counter::TimedOut);
                warn!(timeout_ms = timeout.as_millis() as u64, "sync call timed out");
            }
            Err(err) => debug!(error = %err, "sync call ended without reply"),
        }
        result
    }

    /// Register a waiter for `command` and produce it without blocking.
    ///
    /// Use the returned [`Waiter`] to wait with a custom deadline or to hand
    /// out a [`crate::correlation::CancelHandle`].
    pub fn begin_sync(&self, command: Command) -> Result<Waiter, SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        if !self.inner.config.observes_events() {
            return Err(SyncError::NoEventTopic);
        }

        let waiter = self.inner.pending.register(command.id)?;
        // A failed produce drops the waiter, which withdraws the call.
        self.inner.outbound.produce_command(&command)?;
        Ok(waiter)
    }

    /// Produce `command` without waiting for a reply.
    pub fn async_command(&self, command: &Command) -> Result<(), ProduceError> {
        if self.is_closed() {
            return Err(ProduceError::Closed);
        }
        self.inner.outbound.produce_command(command)
    }

    /// Produce an event outside any handler.
    pub fn produce_event(&self, event: &Event) -> Result<(), ProduceError> {
        if self.is_closed() {
            return Err(ProduceError::Closed);
        }
        self.inner.outbound.produce_event(event)
    }

    /// Stop the group. Pending synchronous calls fail with
    /// `SyncError::Closed`. Idempotent.
    pub fn close(&self) -> Result<(), SubscribeError> {
        self.inner.close()
    }
}
