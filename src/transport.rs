// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Boundary
//!
//! The pipeline talks to the broker only through these traits. The
//! [`crate::channel`] module implements them on top of `lapin`, and
//! [`crate::memory`] provides an in-process broker with the same semantics.

use crate::{
    codec::Envelope,
    errors::{AmqpError, DeclareError, PublishError, SubscribeError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};

/// Stream of deliveries for one consumer, ending when its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// One-shot settlement handle of a delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A connection able to open independent channels concurrently.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// The broker operations used by the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), DeclareError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, DeclareError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), DeclareError>;

    /// Caps the unacknowledged deliveries pushed to consumers opened afterwards.
    async fn qos(&self, prefetch: u16) -> Result<(), SubscribeError>;

    /// Opens a manual-acknowledgment delivery stream on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, SubscribeError>;

    /// Hands the envelope to the broker without waiting for a confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), PublishError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One received envelope plus its settlement handle.
///
/// The handle is private: the only way to settle a delivery is to give it up
/// by value through [`crate::ack::settle`].
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub envelope: Envelope,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    /// Builds a delivery from what a transport received.
    ///
    /// # Parameters
    /// * `delivery_tag` - Broker tag, unique per channel
    /// * `exchange` - Exchange the message was published to
    /// * `routing_key` - Key it was published with
    /// * `redelivered` - Whether an earlier delivery was requeued
    /// * `envelope` - Content type, payload and headers
    /// * `acker` - Settles this delivery on the broker, exactly once
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        envelope: Envelope,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            envelope,
            acker,
        }
    }

    pub(crate) fn into_parts(self) -> (DeliveryInfo, Envelope, Box<dyn DeliveryAcker>) {
        (
            DeliveryInfo {
                delivery_tag: self.delivery_tag,
                exchange: self.exchange,
                routing_key: self.routing_key,
                redelivered: self.redelivered,
            },
            self.envelope,
            self.acker,
        )
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Delivery metadata kept for logging once the envelope has been decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeliveryInfo {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}
