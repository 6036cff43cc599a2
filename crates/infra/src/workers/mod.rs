//! Background delivery loops.

pub mod delivery_worker;

pub use delivery_worker::{DeliveryWorker, WorkerContext, WorkerHandle};
