//! In-memory partitioned log for tests/dev.
//!
//! - No IO
//! - Topics are created on first use with the default partition count
//! - `fetch` long-polls on a condition variable instead of spinning
//! - Committed offsets are kept per (group, topic, partition)

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::broker::{Broker, BrokerError, Cursor, FetchedRecord, Position, Record};
use super::partitioner::compute_partition;

#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    committed: HashMap<(String, String, u32), u64>,
    closed: bool,
}

impl LogState {
    fn topic_mut(&mut self, topic: &str, default_partitions: u32) -> &mut Vec<Vec<Record>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); default_partitions as usize])
    }
}

#[derive(Debug)]
pub struct InMemoryLog {
    state: Mutex<LogState>,
    appended: Condvar,
    default_partitions: u32,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryLog {
    pub fn new(default_partitions: u32) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            appended: Condvar::new(),
            default_partitions: default_partitions.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `topic` with an explicit partition count. No-op if it exists.
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        self.lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    /// Every record of `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Reject further produces and wake blocked fetches.
    pub fn close(&self) {
        self.lock().closed = true;
        self.appended.notify_all();
    }

    fn collect(
        state: &LogState,
        topic: &str,
        cursor: &Cursor,
        max: usize,
    ) -> Vec<FetchedRecord> {
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for (partition, records) in partitions.iter().enumerate() {
            let partition = partition as u32;
            let from = cursor.get(&partition).copied().unwrap_or(0) as usize;
            for (offset, record) in records.iter().enumerate().skip(from) {
                if out.len() >= max {
                    return out;
                }
                out.push(FetchedRecord {
                    record: record.clone(),
                    position: Position {
                        topic: topic.to_string(),
                        partition,
                        offset: offset as u64,
                    },
                });
            }
        }
        out
    }
}

impl Broker for InMemoryLog {
    fn partitions(&self, topic: &str) -> Result<u32, BrokerError> {
        let mut state = self.lock();
        Ok(state.topic_mut(topic, self.default_partitions).len() as u32)
    }

    fn produce(&self, record: Record) -> Result<Position, BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let topic = record.topic.clone();
        let partitions = state.topic_mut(&topic, self.default_partitions);
        let partition = compute_partition(&record.key, partitions.len() as u32);
        let log = &mut partitions[partition as usize];
        log.push(record);
        let position = Position {
            topic,
            partition,
            offset: (log.len() - 1) as u64,
        };
        drop(state);

        self.appended.notify_all();
        Ok(position)
    }

    fn fetch(
        &self,
        topic: &str,
        cursor: &Cursor,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<FetchedRecord>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock();

        loop {
            if state.closed {
                return Err(BrokerError::Closed);
            }

            let records = Self::collect(&state, topic, cursor, max);
            if !records.is_empty() {
                return Ok(records);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            state = self
                .appended
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, BrokerError> {
        Ok(self
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }

    fn commit(&self, group: &str, position: &Position) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let key = (group.to_string(), position.topic.clone(), position.partition);
        let next = position.offset + 1;
        let entry = state.committed.entry(key).or_insert(0);
        // Commits never move backwards.
        *entry = (*entry).max(next);
        Ok(())
    }
}
