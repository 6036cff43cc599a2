//! Pending synchronous calls, keyed by command id.
//!
//! Each outstanding call is one table entry plus a single-slot channel. An
//! entry leaves the table exactly once, through whichever of these gets the
//! lock first:
//!
//! - an observed event whose `parent` matches (`Resolved`)
//! - the caller's deadline (`TimedOut`)
//! - a [`CancelHandle`] (`Cancelled`)
//! - [`PendingCalls::close`] (`Closed`)
//!
//! Whoever loses finds no entry and does nothing. The channel therefore sees
//! at most one outcome, and the caller never waits on an entry nobody can
//! settle.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use commander_core::{CommandId, SyncError};
use commander_events::Event;

#[derive(Debug)]
enum Outcome {
    Resolved(Event),
    Cancelled,
    Closed,
}

#[derive(Debug)]
struct Entry {
    ticket: u64,
    tx: SyncSender<Outcome>,
}

#[derive(Debug, Default)]
struct Table {
    waiters: HashMap<CommandId, Entry>,
    closed: bool,
    next_ticket: u64,
}

/// Table shared by synchronous callers and the event workers of one group.
#[derive(Debug, Default)]
pub struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start waiting for the reply to command `id`.
    ///
    /// Register before producing the command, so a fast reply cannot arrive
    /// before anyone is listening.
    pub fn register(self: &Arc<Self>, id: CommandId) -> Result<Waiter, SyncError> {
        let mut table = self.lock();
        if table.closed {
            return Err(SyncError::Closed);
        }
        if table.waiters.contains_key(&id) {
            return Err(SyncError::AlreadyPending(id));
        }

        let ticket = table.next_ticket;
        table.next_ticket += 1;
        let (tx, rx) = mpsc::sync_channel(1);
        table.waiters.insert(id, Entry { ticket, tx });

        Ok(Waiter {
            id,
            ticket,
            rx,
            calls: Arc::clone(self),
            finished: false,
        })
    }

    /// Offer an observed event. Returns `true` if it answered a pending call.
    pub fn resolve(&self, event: &Event) -> bool {
        if event.parent().is_nil() {
            return false;
        }
        let entry = self.lock().waiters.remove(&event.parent());
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Outcome::Resolved(event.clone()));
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: CommandId) -> bool {
        self.lock().waiters.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every pending call with `SyncError::Closed` and refuse new ones.
    /// Returns the number of calls unblocked. Idempotent.
    pub fn close(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut table = self.lock();
            table.closed = true;
            table.waiters.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &drained {
            let _ = entry.tx.send(Outcome::Closed);
        }
        drained.len()
    }

    fn take(&self, id: CommandId, ticket: u64) -> Option<Entry> {
        let mut table = self.lock();
        match table.waiters.get(&id) {
            Some(entry) if entry.ticket == ticket => table.waiters.remove(&id),
            _ => None,
        }
    }

    fn settle(&self, id: CommandId, ticket: u64, outcome: Outcome) -> bool {
        match self.take(id, ticket) {
            Some(entry) => {
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// The caller's side of one pending call.
///
/// Dropping a waiter without calling [`Waiter::wait`] withdraws the call.
#[derive(Debug)]
pub struct Waiter {
    id: CommandId,
    ticket: u64,
    rx: Receiver<Outcome>,
    calls: Arc<PendingCalls>,
    finished: bool,
}

impl Waiter {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            ticket: self.ticket,
            calls: Arc::downgrade(&self.calls),
        }
    }

    /// Block until the call is settled or `timeout` elapses.
    pub fn wait(mut self, timeout: Duration) -> Result<Event, SyncError> {
        let outcome = match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.calls.take(self.id, self.ticket).is_some() {
                    self.finished = true;
                    return Err(SyncError::Timeout {
                        id: self.id,
                        after: timeout,
                    });
                }
                // Lost the race: the winner already removed the entry and
                // its send is in flight.
                self.rx.recv().unwrap_or(Outcome::Closed)
            }
            Err(RecvTimeoutError::Disconnected) => Outcome::Closed,
        };
        self.finished = true;

        match outcome {
            Outcome::Resolved(event) => Ok(event),
            Outcome::Cancelled => Err(SyncError::Cancelled(self.id)),
            Outcome::Closed => Err(SyncError::Closed),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.finished {
            self.calls.take(self.id, self.ticket);
        }
    }
}

/// Settles a pending call as cancelled from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    id: CommandId,
    ticket: u64,
    calls: Weak<PendingCalls>,
}

impl CancelHandle {
    /// Returns `false` if the call was already settled.
    pub fn cancel(&self) -> bool {
        self.calls
            .upgrade()
            .is_some_and(|calls| calls.settle(self.id, self.ticket, Outcome::Cancelled))
    }
}
