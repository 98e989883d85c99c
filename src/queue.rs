// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! Types describing the queues a subscription reads from: their durability
//! class, dead-letter wiring and the binding that attaches them to an
//! exchange.

use std::collections::BTreeMap;

/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument for the maximum number of ready messages
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// How long a queue lives and who may use it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Durability {
    /// Survives broker restart, never auto-deleted, shared between consumers.
    #[default]
    Durable,
    /// Exclusive to the declaring connection and deleted when it closes.
    Transient,
}

impl Durability {
    /// Value of the `durable` flag on `queue.declare`.
    pub fn durable(&self) -> bool {
        matches!(self, Durability::Durable)
    }

    /// Value of the `exclusive` flag; only transient queues are locked to
    /// their connection.
    pub fn exclusive(&self) -> bool {
        matches!(self, Durability::Transient)
    }

    /// Value of the `auto_delete` flag.
    pub fn auto_delete(&self) -> bool {
        matches!(self, Durability::Transient)
    }
}

/// Where discarded messages go.
///
/// Without one, a `NackDiscard` drops the message for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub exchange: String,
    pub routing_key: Option<String>,
}

impl DeadLetterConfig {
    /// Dead-letters to `exchange`, keeping each message's routing key.
    pub fn new(exchange: &str) -> Self {
        DeadLetterConfig {
            exchange: exchange.to_owned(),
            routing_key: None,
        }
    }

    /// Overrides the routing key the broker uses when dead-lettering.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }
}

/// Value of a queue declaration argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    LongString(String),
    LongInt(i32),
}

impl ArgumentValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgumentValue::LongString(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            ArgumentValue::LongInt(value) => Some(*value),
            _ => None,
        }
    }
}

pub type QueueArguments = BTreeMap<String, ArgumentValue>;

/// Definition of a queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durability: Durability,
    pub(crate) dead_letter: Option<DeadLetterConfig>,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
}

impl QueueDefinition {
    /// Creates a durable queue definition with no extra arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durability: Durability::Durable,
            dead_letter: None,
            ttl: None,
            max_length: None,
        }
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn durable(self) -> Self {
        self.durability(Durability::Durable)
    }

    pub fn transient(self) -> Self {
        self.durability(Durability::Transient)
    }

    /// Routes discarded and expired messages to `config.exchange`.
    pub fn dead_letter(mut self, config: Option<DeadLetterConfig>) -> Self {
        self.dead_letter = config;
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of ready messages; the oldest overflow first.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dead_letter_config(&self) -> Option<&DeadLetterConfig> {
        self.dead_letter.as_ref()
    }

    /// The `x-*` arguments sent with the queue declaration.
    pub fn arguments(&self) -> QueueArguments {
        let mut args = QueueArguments::new();

        if let Some(dlx) = &self.dead_letter {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                ArgumentValue::LongString(dlx.exchange.clone()),
            );

            if let Some(key) = &dlx.routing_key {
                args.insert(
                    AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                    ArgumentValue::LongString(key.clone()),
                );
            }
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                AMQP_HEADERS_MESSAGE_TTL.to_owned(),
                ArgumentValue::LongInt(ttl),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH.to_owned(),
                ArgumentValue::LongInt(max),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue` with an empty exchange and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key, or pattern on topic exchanges.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// A declared queue as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durability_flags() {
        assert!(Durability::Durable.durable());
        assert!(!Durability::Durable.exclusive());
        assert!(!Durability::Durable.auto_delete());

        assert!(!Durability::Transient.durable());
        assert!(Durability::Transient.exclusive());
        assert!(Durability::Transient.auto_delete());
    }

    #[test]
    fn no_arguments_by_default() {
        assert!(QueueDefinition::new("war").arguments().is_empty());
    }

    #[test]
    fn dead_letter_arguments() {
        let def = QueueDefinition::new("pause.bob")
            .transient()
            .dead_letter(Some(DeadLetterConfig::new("peril_dlx")));

        let args = def.arguments();
        assert_eq!(args.len(), 1);
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                .and_then(|v| v.as_str()),
            Some("peril_dlx")
        );
    }

    #[test]
    fn ttl_max_length_and_routing_key_arguments() {
        let def = QueueDefinition::new("game_logs")
            .dead_letter(Some(
                DeadLetterConfig::new("peril_dlx").routing_key("game_logs.dead"),
            ))
            .ttl(60_000)
            .max_length(100);

        let args = def.arguments();
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                .and_then(|v| v.as_str()),
            Some("game_logs.dead")
        );
        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL).and_then(|v| v.as_int()),
            Some(60_000)
        );
        assert_eq!(
            args.get(AMQP_HEADERS_MAX_LENGTH).and_then(|v| v.as_int()),
            Some(100)
        );
    }

    #[test]
    fn binding_builder() {
        let binding = QueueBinding::new("war")
            .exchange("peril_topic")
            .routing_key("war.*");
        assert_eq!(binding.queue_name(), "war");
        assert_eq!(binding.exchange_name(), "peril_topic");
        assert_eq!(binding.key(), "war.*");
    }
}
