//! Per-group counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Counter {
    /// Dispatched to a registered handler.
    Handled,
    /// No handler for the action; acked without processing.
    Unhandled,
    HandlerFailures,
    DecodeFailures,
    /// Synchronous calls answered by an observed event.
    Resolved,
    TimedOut,
}

#[derive(Debug, Default)]
pub struct GroupStats {
    handled: AtomicU64,
    unhandled: AtomicU64,
    handler_failures: AtomicU64,
    decode_failures: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time copy of [`GroupStats`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub handled: u64,
    pub unhandled: u64,
    pub handler_failures: u64,
    pub decode_failures: u64,
    pub resolved: u64,
    pub timed_out: u64,
}

impl GroupStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.cell(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            handled: self.get(Counter::Handled),
            unhandled: self.get(Counter::Unhandled),
            handler_failures: self.get(Counter::HandlerFailures),
            decode_failures: self.get(Counter::DecodeFailures),
            resolved: self.get(Counter::Resolved),
            timed_out: self.get(Counter::TimedOut),
        }
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Handled => &self.handled,
            Counter::Unhandled => &self.unhandled,
            Counter::HandlerFailures => &self.handler_failures,
            Counter::DecodeFailures => &self.decode_failures,
            Counter::Resolved => &self.resolved,
            Counter::TimedOut => &self.timed_out,
        }
    }
}
