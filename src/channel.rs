// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the transport traits on top of `lapin`. It
//! establishes the RabbitMQ connection, opens channels on it, and translates
//! the pipeline's queue, binding and envelope types to their AMQP wire form.

use crate::{
    codec::Envelope,
    config::RabbitMqConfig,
    errors::{AmqpError, DeclareError, PublishError, SubscribeError},
    exchange::ExchangeDefinition,
    queue::{ArgumentValue, QueueArguments, QueueBinding, QueueDefinition, QueueHandle},
    transport::{AmqpChannel, AmqpConnection, Delivery, DeliveryAcker, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// A RabbitMQ connection shared by every channel the pipeline opens.
pub struct LapinConnection {
    conn: Arc<Connection>,
}

impl LapinConnection {
    /// Connects to the broker described by `cfg`.
    ///
    /// # Example
    /// ```no_run
    /// # async fn run() -> Result<(), amqp_pubsub::errors::AmqpError> {
    /// let cfg = amqp_pubsub::config::RabbitMqConfig::default();
    /// let conn = amqp_pubsub::channel::LapinConnection::connect(&cfg).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(cfg: &RabbitMqConfig) -> Result<Self, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        match Connection::connect(&cfg.uri(), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(LapinConnection {
                    conn: Arc::new(conn),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }

    /// Closes the connection; transient queues it owns are deleted by the broker.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

/// A `lapin` channel speaking the pipeline's transport traits.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), DeclareError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(DeclareError::DeclareExchangeError(
                    def.name.clone(),
                    err.to_string(),
                ))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, DeclareError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durability.durable(),
                    exclusive: def.durability.exclusive(),
                    auto_delete: def.durability.auto_delete(),
                    nowait: false,
                },
                field_table(&def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = %def.name, "failure to declare queue");
                Err(DeclareError::DeclareQueueError(
                    def.name.clone(),
                    err.to_string(),
                ))
            }
            Ok(queue) => {
                debug!("queue: {} was created", def.name);
                Ok(QueueHandle {
                    name: queue.name().to_string(),
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                })
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), DeclareError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(DeclareError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    err.to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), SubscribeError> {
        match self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), prefetch, "error to configure qos");
                Err(SubscribeError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, SubscribeError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(SubscribeError::BindingConsumerError(
                    queue.to_owned(),
                    err.to_string(),
                ))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), PublishError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in envelope.headers {
            headers.insert(
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            );
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type))
            .with_headers(FieldTable::from(headers));
        if let Some(id) = envelope.message_id {
            properties = properties.with_message_id(ShortString::from(id));
        }

        // The returned confirm is dropped: publishes are fire-and-forget.
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(PublishError::PublishingError {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    reason: err.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

/// Settles a `lapin` delivery through its acker.
struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.0.ack(BasicAckOptions { multiple: false }).await {
            Ok(_) => Ok(()),
            Err(err) => Err(AmqpError::AckMessageError(err.to_string())),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if requeue => Err(AmqpError::RequeuingMessageError(err.to_string())),
            Err(err) => Err(AmqpError::NackMessageError(err.to_string())),
        }
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let content_type = properties
        .content_type()
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_default();

    let mut envelope = Envelope::new(&content_type, data).with_headers(string_headers(&properties));
    if let Some(id) = properties.message_id() {
        envelope = envelope.with_message_id(id.to_string());
    }

    Delivery::new(
        delivery_tag,
        exchange.as_str(),
        routing_key.as_str(),
        redelivered,
        envelope,
        Box::new(LapinAcker(acker)),
    )
}

/// Keeps the UTF-8 long-string headers, which is what the publisher writes.
fn string_headers(properties: &BasicProperties) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                if let Ok(value) = std::str::from_utf8(value.as_bytes()) {
                    headers.insert(key.to_string(), value.to_owned());
                }
            }
        }
    }

    headers
}

fn field_table(args: &QueueArguments) -> FieldTable {
    let mut table = BTreeMap::new();

    for (key, value) in args {
        let value = match value {
            ArgumentValue::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
            ArgumentValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
        };
        table.insert(ShortString::from(key.clone()), value);
    }

    FieldTable::from(table)
}
