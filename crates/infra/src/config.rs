//! Configuration loading and representation.
//!
//! Values come from code or serde (files) first; `from_env` fills the common
//! single-command-topic/single-event-topic layout from environment variables.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use commander_core::ConfigError;
use commander_events::{Topic, TopicKind};

pub const COMMAND_TOPIC_VAR: &str = "COMMANDER_COMMAND_TOPIC";
pub const EVENT_TOPIC_VAR: &str = "COMMANDER_EVENT_TOPIC";
pub const TIMEOUT_VAR: &str = "COMMANDER_TIMEOUT_MS";
pub const CONSUMER_GROUP_VAR: &str = "COMMANDER_CONSUMER_GROUP";
pub const MAX_RETRIES_VAR: &str = "COMMANDER_MAX_RETRIES";

pub const DEFAULT_COMMAND_TOPIC: &str = "commands";
pub const DEFAULT_EVENT_TOPIC: &str = "events";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic set and call behavior of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub topics: Vec<Topic>,
    /// Default deadline of synchronous calls.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Nack inbound messages that carry soft field errors instead of
    /// dispatching them with nil fields.
    #[serde(default)]
    pub strict_decoding: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            topics: vec![
                Topic::command(DEFAULT_COMMAND_TOPIC),
                Topic::event(DEFAULT_EVENT_TOPIC),
            ],
            timeout: DEFAULT_TIMEOUT,
            strict_decoding: false,
        }
    }
}

impl GroupConfig {
    pub fn new(topics: Vec<Topic>) -> Self {
        Self {
            topics,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_strict_decoding(mut self, strict: bool) -> Self {
        self.strict_decoding = strict;
        self
    }

    /// Read the config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`GroupConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let command_topic =
            lookup(COMMAND_TOPIC_VAR).unwrap_or_else(|| DEFAULT_COMMAND_TOPIC.to_string());
        let event_topic = lookup(EVENT_TOPIC_VAR).unwrap_or_else(|| DEFAULT_EVENT_TOPIC.to_string());
        let timeout = match lookup(TIMEOUT_VAR) {
            Some(raw) => Duration::from_millis(parse_var(TIMEOUT_VAR, &raw)?),
            None => DEFAULT_TIMEOUT,
        };

        let config = Self::new(vec![Topic::command(command_topic), Topic::event(event_topic)])
            .with_timeout(timeout);
        config.validate()?;
        Ok(config)
    }

    /// Reject topic sets and timeouts a group cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }

        let mut seen = HashSet::new();
        for topic in &self.topics {
            if topic.name.trim().is_empty() {
                return Err(ConfigError::EmptyTopicName);
            }
            if !seen.insert(topic.name.as_str()) {
                return Err(ConfigError::DuplicateTopic(topic.name.clone()));
            }
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// First producible topic of `kind`; this is where the group writes.
    pub fn producible(&self, kind: TopicKind) -> Option<&Topic> {
        self.topics.iter().find(|t| t.kind == kind && t.produce)
    }

    pub fn consumable(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter().filter(|t| t.consume)
    }

    /// Whether replies to synchronous calls can be observed at all.
    pub fn observes_events(&self) -> bool {
        self.consumable().any(|t| t.kind == TopicKind::Event)
    }
}

/// Settings of the log-backed dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDialectConfig {
    /// Consumer group committed offsets are stored under.
    pub consumer_group: String,
    /// Longest a fetch blocks when the log has nothing new.
    pub poll_wait: Duration,
    pub max_batch: usize,
    /// Redeliveries of a nacked record before it is dead-lettered.
    pub max_retries: u32,
    /// Delay before the first redelivery; doubles per attempt.
    pub retry_backoff: Duration,
    pub dead_letter_suffix: String,
}

impl Default for LogDialectConfig {
    fn default() -> Self {
        Self {
            consumer_group: "commander".to_string(),
            poll_wait: Duration::from_millis(100),
            max_batch: 64,
            max_retries: 3,
            retry_backoff: Duration::from_millis(20),
            dead_letter_suffix: ".dlq".to_string(),
        }
    }
}

impl LogDialectConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(group) = lookup(CONSUMER_GROUP_VAR) {
            if group.trim().is_empty() {
                return Err(ConfigError::Env {
                    var: CONSUMER_GROUP_VAR,
                    reason: "must not be empty".to_string(),
                });
            }
            config.consumer_group = group;
        }
        if let Some(raw) = lookup(MAX_RETRIES_VAR) {
            config.max_retries = parse_var(MAX_RETRIES_VAR, &raw)?;
        }
        Ok(config)
    }

    pub fn dead_letter_topic(&self, topic: &str) -> String {
        format!("{topic}{}", self.dead_letter_suffix)
    }

    /// Backoff before redelivery `attempt` (1-based), capped at 64x.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(6);
        self.retry_backoff.saturating_mul(factor)
    }
}

fn parse_var<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        reason: format!("{raw:?}: {e}"),
    })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = GroupConfig::default();
        config.validate().unwrap();
        assert!(config.observes_events());
        assert_eq!(
            config.producible(TopicKind::Command).map(|t| t.name.as_str()),
            Some("commands")
        );
    }

    #[test]
    fn validate_rejects_bad_topic_sets() {
        assert_eq!(GroupConfig::new(vec![]).validate(), Err(ConfigError::NoTopics));
        assert_eq!(
            GroupConfig::new(vec![Topic::command(" ")]).validate(),
            Err(ConfigError::EmptyTopicName)
        );
        assert_eq!(
            GroupConfig::new(vec![Topic::command("a"), Topic::event("a")]).validate(),
            Err(ConfigError::DuplicateTopic("a".to_string()))
        );
        assert_eq!(
            GroupConfig::default().with_timeout(Duration::ZERO).validate(),
            Err(ConfigError::ZeroTimeout)
        );
    }

    #[test]
    fn from_lookup_uses_defaults_and_overrides() {
        let config = GroupConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(config, GroupConfig::default());

        let config = GroupConfig::from_lookup(env(&[
            (COMMAND_TOPIC_VAR, "orders.commands"),
            (TIMEOUT_VAR, "250"),
        ]))
        .unwrap();
        assert_eq!(config.topics[0].name, "orders.commands");
        assert_eq!(config.topics[1].name, "events");
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn from_lookup_reports_the_bad_variable() {
        let err = GroupConfig::from_lookup(env(&[(TIMEOUT_VAR, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: TIMEOUT_VAR, .. }));

        let err = GroupConfig::from_lookup(env(&[(TIMEOUT_VAR, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::ZeroTimeout);
    }

    #[test]
    fn deserializes_from_json() {
        let config: GroupConfig = serde_json::from_str(
            r#"{"topics":[{"name":"c","kind":"command"},{"name":"e","kind":"event","produce":false}],"timeout_ms":1500}"#,
        )
        .unwrap();

        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert!(!config.strict_decoding);
        assert!(config.topics[1].consume);
        assert!(!config.topics[1].produce);
        assert!(config.producible(TopicKind::Event).is_none());

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout_ms"], 1500);
    }

    #[test]
    fn log_dialect_config_from_lookup() {
        let config = LogDialectConfig::from_lookup(env(&[
            (CONSUMER_GROUP_VAR, "billing"),
            (MAX_RETRIES_VAR, "7"),
        ]))
        .unwrap();
        assert_eq!(config.consumer_group, "billing");
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.dead_letter_topic("commands"), "commands.dlq");

        assert!(LogDialectConfig::from_lookup(env(&[(MAX_RETRIES_VAR, "-1")])).is_err());
        assert!(LogDialectConfig::from_lookup(env(&[(CONSUMER_GROUP_VAR, "")])).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = LogDialectConfig {
            retry_backoff: Duration::from_millis(10),
            ..LogDialectConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(3), Duration::from_millis(40));
        assert_eq!(config.backoff(40), Duration::from_millis(640));
    }
}
