// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Dispatcher
//!
//! Runs one consume loop per subscription. Setup declares and binds the
//! queue, applies the prefetch limit and opens a manual-ack delivery stream;
//! any failure there is returned to the caller. The loop then resolves
//! deliveries strictly one at a time, so within a queue acknowledgment order
//! equals arrival order. Different subscriptions run as independent tasks.

use crate::{
    codec::{decode_binary, decode_json, Decoder},
    config::{RabbitMqConfig, DEFAULT_PREFETCH},
    consumer::consume,
    errors::SubscribeError,
    handler::Handler,
    otel::CONSUMER_TRACER,
    queue::{DeadLetterConfig, Durability, QueueBinding, QueueDefinition, QueueHandle},
    topology::AmqpTopology,
    transport::{AmqpChannel, AmqpConnection, DeliveryStream},
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Where a subscription reads from and how much it may hold unacknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDefinition {
    pub(crate) exchange: String,
    pub(crate) queue: String,
    pub(crate) routing_key: String,
    pub(crate) durability: Durability,
    pub(crate) prefetch: u16,
    pub(crate) dead_letter: Option<DeadLetterConfig>,
}

impl SubscriptionDefinition {
    /// A durable subscription with the default prefetch and no dead-lettering.
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        SubscriptionDefinition {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            durability: Durability::Durable,
            prefetch: DEFAULT_PREFETCH,
            dead_letter: None,
        }
    }

    /// A durable subscription taking its prefetch and dead-letter exchange
    /// from `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Loaded broker configuration
    /// * `exchange` - Exchange the queue is bound to
    /// * `queue` - Queue name
    /// * `routing_key` - Binding key, a pattern on topic exchanges
    pub fn from_config(
        cfg: &RabbitMqConfig,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Self {
        SubscriptionDefinition::new(exchange, queue, routing_key)
            .prefetch(cfg.prefetch)
            .dead_letter(cfg.dead_letter())
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Exclusive to the subscribing connection and deleted when it closes.
    pub fn transient(self) -> Self {
        self.durability(Durability::Transient)
    }

    /// Caps unacknowledged deliveries held by this subscription.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Where discarded deliveries go; `None` drops them.
    pub fn dead_letter(mut self, config: Option<DeadLetterConfig>) -> Self {
        self.dead_letter = config;
        self
    }

    /// The queue this subscription declares.
    pub fn queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new(&self.queue)
            .durability(self.durability)
            .dead_letter(self.dead_letter.clone())
    }

    pub fn queue_binding(&self) -> QueueBinding {
        QueueBinding::new(&self.queue)
            .exchange(&self.exchange)
            .routing_key(&self.routing_key)
    }
}

/// A running consume loop.
///
/// Dropping the handle leaves the loop running; it ends on its own when the
/// delivery stream closes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: QueueHandle,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// The queue as declared during setup.
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Tag the broker knows this consumer by, `<queue>-<uuid>`.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the consume loop has ended, normally or by abort or panic.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the delivery stream to close.
    pub async fn closed(self) {
        if let Err(err) = self.task.await {
            error!(error = err.to_string(), "consume loop terminated abnormally");
        }
    }

    /// Stops the loop. Deliveries it still holds stay unacknowledged until
    /// the broker reclaims them.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Opens subscriptions on a shared connection, one channel each.
pub struct Subscriber {
    connection: Arc<dyn AmqpConnection>,
}

impl Subscriber {
    /// Creates a subscriber.
    ///
    /// # Parameters
    /// * `connection` - Connection every subscription opens its channel on
    pub fn new(connection: Arc<dyn AmqpConnection>) -> Self {
        Subscriber { connection }
    }

    /// Declares the subscription's topology and starts its consume loop.
    ///
    /// Returns once the delivery stream is open. Each delivery is decoded
    /// with `decoder`; undecodable ones are discarded, the rest are settled
    /// according to what `handler` returns.
    pub async fn subscribe<T, H, D>(
        &self,
        def: &SubscriptionDefinition,
        handler: H,
        decoder: D,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        T: Send + 'static,
        H: Handler<T> + 'static,
        D: Decoder<T> + 'static,
    {
        let channel = self.connection.create_channel().await?;
        let (queue, consumer_tag, stream) = open_stream(channel.clone(), def).await?;

        info!(
            queue = %queue.name,
            exchange = %def.exchange,
            routing_key = %def.routing_key,
            prefetch = def.prefetch,
            "consuming"
        );

        let task = tokio::spawn(run::<T>(
            channel,
            queue.name.clone(),
            stream,
            Box::new(handler),
            Box::new(decoder),
        ));

        Ok(SubscriptionHandle {
            queue,
            consumer_tag,
            task,
        })
    }

    /// Subscribes with JSON payloads.
    pub async fn subscribe_json<T, H>(
        &self,
        def: &SubscriptionDefinition,
        handler: H,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.subscribe(def, handler, decode_json::<T>).await
    }

    /// Subscribes with binary payloads.
    pub async fn subscribe_binary<T, H>(
        &self,
        def: &SubscriptionDefinition,
        handler: H,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.subscribe(def, handler, decode_binary::<T>).await
    }
}

async fn open_stream(
    channel: Arc<dyn AmqpChannel>,
    def: &SubscriptionDefinition,
) -> Result<(QueueHandle, String, DeliveryStream), SubscribeError> {
    let queue = AmqpTopology::new(channel.clone())
        .declare_and_bind(&def.queue_definition(), &def.queue_binding())
        .await?;

    channel.qos(def.prefetch).await?;

    let consumer_tag = format!("{}-{}", queue.name, Uuid::new_v4());
    let stream = channel.consume(&queue.name, &consumer_tag).await?;

    Ok((queue, consumer_tag, stream))
}

async fn run<T>(
    // Owned by the loop so the channel lives exactly as long as it does.
    _channel: Arc<dyn AmqpChannel>,
    queue: String,
    mut stream: DeliveryStream,
    handler: Box<dyn Handler<T>>,
    decoder: Box<dyn Decoder<T>>,
) where
    T: Send + 'static,
{
    let tracer = global::tracer(CONSUMER_TRACER);

    while let Some(result) = stream.next().await {
        match result {
            Ok(delivery) => {
                let settled = consume(&tracer, delivery, decoder.as_ref(), handler.as_ref()).await;
                if let Err(err) = settled {
                    error!(error = err.to_string(), queue = %queue, "error consume msg");
                }
            }
            Err(err) => error!(error = err.to_string(), queue = %queue, "errors consume msg"),
        }
    }

    debug!(queue = %queue, "delivery stream closed");
}
