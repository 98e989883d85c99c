// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Encodes typed values and hands them to an exchange. Publishing is
//! fire-and-forget: once the envelope is handed to the transport no confirm
//! is awaited, and nothing is retried. The current OpenTelemetry context is
//! propagated in the envelope headers so consumers can continue the trace.

use crate::{
    codec::{BinaryCodec, Codec, JsonCodec},
    errors::{AmqpError, PublishError},
    otel,
    transport::{AmqpChannel, AmqpConnection},
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes typed messages through one channel.
///
/// A single publisher is meant to be opened once and shared, including with
/// handlers that publish follow-up messages.
pub struct Publisher {
    channel: Arc<dyn AmqpChannel>,
}

impl Publisher {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Arc<Publisher> {
        Arc::new(Publisher { channel })
    }

    /// Opens a dedicated channel on `connection` for publishing.
    pub async fn open(connection: &dyn AmqpConnection) -> Result<Arc<Publisher>, AmqpError> {
        let channel = connection.create_channel().await?;
        Ok(Publisher::new(channel))
    }

    /// Encodes `value` with `C` and publishes it to `exchange` under
    /// `routing_key`.
    ///
    /// On encode failure the transport is never contacted.
    pub async fn publish<C, T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PublishError>
    where
        C: Codec,
        T: Serialize,
    {
        let mut envelope = match C::envelope(value) {
            Ok(envelope) => envelope.with_message_id(Uuid::new_v4().to_string()),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange,
                    routing_key,
                    "failure to encode message"
                );
                return Err(err.into());
            }
        };

        otel::inject(&Context::current(), &mut envelope);

        let message_id = envelope.message_id.clone().unwrap_or_default();
        self.channel.publish(exchange, routing_key, envelope).await?;

        debug!(
            exchange,
            routing_key,
            message_id = %message_id,
            content_type = C::CONTENT_TYPE,
            "message published"
        );

        Ok(())
    }

    /// Publishes `value` as JSON.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PublishError>
    where
        T: Serialize,
    {
        self.publish::<JsonCodec, T>(exchange, routing_key, value).await
    }

    /// Publishes `value` with the compact binary codec.
    pub async fn publish_binary<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PublishError>
    where
        T: Serialize,
    {
        self.publish::<BinaryCodec, T>(exchange, routing_key, value).await
    }
}
