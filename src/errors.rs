// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Delivery Pipeline
//!
//! Errors are split by the stage that produces them. Setup-time errors
//! (`DeclareError`, `SubscribeError`) and publish errors are returned to the
//! caller, while per-message errors (`DecodeError`, ack failures) are contained
//! to the single delivery that raised them.

use thiserror::Error;

/// Errors raised by the broker connection itself or by the per-delivery
/// acknowledgment calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel, or using a channel that is already closed
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message without requeue
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error negative-acknowledging a message with requeue
    #[error("failure to requeuing message: {0}")]
    RequeuingMessageError(String),

    /// Error reading from an open delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Errors raised while declaring exchanges, queues and bindings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeclareError {
    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// The queue already exists with different flags or arguments
    #[error("queue `{0}` already declared with inequivalent flags or arguments")]
    QueueConflict(String),

    /// The queue is exclusive to another connection
    #[error("queue `{0}` is locked by another connection")]
    QueueLocked(String),

    /// The referenced exchange does not exist
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// The channel used for declaring failed
    #[error(transparent)]
    Channel(#[from] AmqpError),
}

/// Error serializing a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failure to encode `{content_type}` payload: {reason}")]
pub struct EncodeError {
    pub content_type: String,
    pub reason: String,
}

/// Errors deserializing an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes do not match the expected schema
    #[error("failure to parse `{content_type}` payload: {reason}")]
    ParsePayloadError { content_type: String, reason: String },

    /// No codec is registered for the envelope's content type
    #[error("unsupported content type `{0}`")]
    UnsupportedContentType(String),
}

/// Errors surfaced to callers of the publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The value could not be encoded; the transport was never contacted
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The transport refused the handoff
    #[error("failure to publish to `{exchange}` with key `{routing_key}`: {reason}")]
    PublishingError {
        exchange: String,
        routing_key: String,
        reason: String,
    },
}

/// Errors that abort a subscription during setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// Declaring or binding the queue failed
    #[error(transparent)]
    Declare(#[from] DeclareError),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error opening the delivery stream
    #[error("failure to declare consumer on `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error opening the subscription's channel
    #[error(transparent)]
    Channel(#[from] AmqpError),
}
