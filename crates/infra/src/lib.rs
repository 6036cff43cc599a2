//! Runtime layer: groups, routing, correlation, delivery workers and the
//! log-backed dialect.

pub mod config;
pub mod correlation;
pub mod dialect;
pub mod group;
pub mod middleware;
pub mod responder;
pub mod router;
pub mod stats;
pub mod workers;

mod integration_tests;

pub use config::{GroupConfig, LogDialectConfig};
pub use correlation::{CancelHandle, PendingCalls, Waiter};
pub use dialect::{InMemoryLog, LogDialect};
pub use group::{Group, GroupBuilder, GroupError};
pub use middleware::{Middleware, Next};
pub use responder::{Outbound, Responder};
pub use router::{Dispatch, Handler, Inbound, Router};
pub use stats::{Counter, StatsSnapshot};
