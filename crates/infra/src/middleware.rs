//! Interceptors run around every dispatched command/event.
//!
//! A middleware receives the rest of the chain as `next` and returns a new
//! callable. It may inspect or rewrite the inbound message, call `next` zero
//! or one times, and act on the result. The chain is composed once when the
//! group starts; the first registered middleware is the outermost.

use std::sync::Arc;

use tracing::info_span;

use crate::responder::Responder;
use crate::router::Inbound;

/// The remainder of the dispatch chain.
pub type Next = Arc<dyn Fn(&Responder, Inbound) -> anyhow::Result<()> + Send + Sync>;

pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, next: Next) -> Next;
}

impl<F> Middleware for F
where
    F: Fn(Next) -> Next + Send + Sync + 'static,
{
    fn wrap(&self, next: Next) -> Next {
        self(next)
    }
}

/// Fold `middleware` around `endpoint`, first element outermost.
pub fn compose(middleware: &[Arc<dyn Middleware>], endpoint: Next) -> Next {
    middleware
        .iter()
        .rev()
        .fold(endpoint, |next, layer| layer.wrap(next))
}

/// Opens a `dispatch` span for each message so handler logs carry its kind,
/// action, id and topic.
pub fn trace() -> impl Middleware {
    |next: Next| -> Next {
        Arc::new(move |responder: &Responder, inbound: Inbound| {
            let span = info_span!(
                "dispatch",
                kind = %inbound.kind(),
                action = inbound.action(),
                id = %inbound.id(),
                topic = inbound.origin().map(|t| t.name.as_str()).unwrap_or(""),
            );
            let _entered = span.enter();
            next(responder, inbound)
        })
    }
}
