//! Transport seam.
//!
//! A dialect bundles a producer, a consumer and the marshaller they agree on.
//! Everything above this module talks to `dyn Dialect` only, so a group runs
//! unchanged over the in-process mock or over a partitioned log.

use std::sync::Arc;

use commander_core::{ProduceError, SubscribeError};

use crate::consumer::Consumer;
use crate::marshal::Marshaller;
use crate::message::Message;

/// Write side of a dialect.
pub trait Producer: Send + Sync {
    /// Append `message` to `message.topic`. Failures are returned to the
    /// caller and never retried here.
    fn produce(&self, message: Message) -> Result<(), ProduceError>;
}

pub trait Dialect: Send + Sync {
    fn consumer(&self) -> &dyn Consumer;

    fn producer(&self) -> &dyn Producer;

    fn marshaller(&self) -> &dyn Marshaller;

    /// Cheap liveness probe. Transports without a connection are always
    /// healthy until closed.
    fn healthy(&self) -> bool {
        true
    }

    /// Release transport resources. Must be idempotent.
    fn close(&self) -> Result<(), SubscribeError> {
        self.consumer().close()
    }
}

impl<D> Dialect for Arc<D>
where
    D: Dialect + ?Sized,
{
    fn consumer(&self) -> &dyn Consumer {
        (**self).consumer()
    }

    fn producer(&self) -> &dyn Producer {
        (**self).producer()
    }

    fn marshaller(&self) -> &dyn Marshaller {
        (**self).marshaller()
    }

    fn healthy(&self) -> bool {
        (**self).healthy()
    }

    fn close(&self) -> Result<(), SubscribeError> {
        (**self).close()
    }
}
