//! Log-backed dialect and the broker seam under it.

pub mod broker;
pub mod in_memory_log;
pub mod log;
pub mod partitioner;

pub use broker::{Broker, BrokerError, Cursor, FetchedRecord, Position, Record};
pub use in_memory_log::InMemoryLog;
pub use log::LogDialect;
pub use partitioner::compute_partition;
