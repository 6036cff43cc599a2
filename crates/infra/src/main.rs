//! Request/reply demo over the in-memory log.
//!
//! Starts a group with an `example` command handler that answers with a
//! `created` event, then issues one synchronous command and logs the reply.

use std::sync::Arc;

use anyhow::Context;

use commander_core::StreamKey;
use commander_events::{Command, TopicKind};
use commander_infra::middleware;
use commander_infra::{
    GroupBuilder, GroupConfig, InMemoryLog, Inbound, LogDialect, LogDialectConfig, Responder,
};

fn create(responder: &Responder, inbound: Inbound) -> anyhow::Result<()> {
    let command = inbound.as_command().context("expected a command")?;
    let event = responder.produce_event("created", 1, command.key, command.data.clone())?;
    tracing::info!(event = %event.id(), "answered");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    commander_observability::init();

    let config = GroupConfig::from_env().context("invalid group configuration")?;
    let log_config = LogDialectConfig::from_env().context("invalid log dialect configuration")?;
    let dialect = LogDialect::new(Arc::new(InMemoryLog::new(4)), log_config);

    let group = GroupBuilder::new(config)
        .use_middleware(middleware::trace())
        .handle_func(TopicKind::Command, "example", create)?
        .start(dialect)?;

    let command = Command::new("example", 1, StreamKey::new(), br#"{"name":"widget"}"#.to_vec());
    match group.sync_command(command) {
        Ok(event) => tracing::info!(
            action = event.action(),
            status = %event.status(),
            parent = %event.parent(),
            data = %String::from_utf8_lossy(event.data()),
            "sync command resolved"
        ),
        Err(err) => tracing::error!(error = %err, "sync command failed"),
    }

    tracing::info!(stats = ?group.stats(), "shutting down");
    group.close()?;
    Ok(())
}
