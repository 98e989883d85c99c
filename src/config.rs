// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection and pipeline settings, loaded from an optional YAML file and
//! overridden by `RABBITMQ_*` environment variables.

use crate::queue::DeadLetterConfig;
use serde::Deserialize;

/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RABBITMQ";
/// Prefetch used when none is configured.
pub const DEFAULT_PREFETCH: u16 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker for this connection.
    pub connection_name: String,
    /// Unacknowledged deliveries allowed per subscription, applied by
    /// `SubscriptionDefinition::from_config`.
    pub prefetch: u16,
    /// Exchange receiving discarded messages of queues declared with it.
    pub dead_letter_exchange: Option<String>,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        RabbitMqConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
            prefetch: DEFAULT_PREFETCH,
            dead_letter_exchange: None,
        }
    }
}

impl RabbitMqConfig {
    /// Loads the configuration.
    ///
    /// Sources, later overriding earlier:
    /// 1. defaults
    /// 2. the YAML file at `path`, if given
    /// 3. `RABBITMQ_*` environment variables (e.g. `RABBITMQ_PREFETCH=5`)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        use config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(Environment::with_prefix(CONFIG_ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Dead-letter wiring for queues declared with this configuration.
    pub fn dead_letter(&self) -> Option<DeadLetterConfig> {
        self.dead_letter_exchange
            .as_deref()
            .map(DeadLetterConfig::new)
    }

    /// The AMQP URI for this broker, with user, password and vhost
    /// percent-encoded.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode_component(&self.user),
            encode_component(&self.password),
            self.host,
            self.port,
            encode_component(&self.vhost)
        )
    }
}

/// Percent-encodes everything outside the URI unreserved set.
fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(char::from(byte))
            }
            _ => encoded.push_str(&format!("%{byte:02x}")),
        }
    }
    encoded
}
