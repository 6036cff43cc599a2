//! Messages, commands, events and the transport contracts they travel over.
//!
//! Everything here is mechanics only: no threads are spawned outside the
//! mock dialect and no broker is assumed.

pub mod command;
pub mod consumer;
pub mod dialect;
pub mod event;
pub mod marshal;
pub mod message;
pub mod metadata;
pub mod mock;

pub use command::Command;
pub use consumer::{Ack, AckResult, Acker, Consumer, Delivery, Subscription, SubscriptionId};
pub use dialect::{Dialect, Producer};
pub use event::{Event, StatusCode};
pub use marshal::{JsonMarshaller, Marshaller};
pub use message::{Header, Message, Topic, TopicKind};
pub use metadata::Populated;
pub use mock::MockDialect;
