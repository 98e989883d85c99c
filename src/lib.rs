// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqp-pubsub
//!
//! Typed publish/subscribe over AMQP exchanges. Producers publish serializable
//! values through a [`publisher::Publisher`]; consumers register a
//! [`handler::Handler`] per subscription through a
//! [`dispatcher::Subscriber`] and answer each message with an
//! [`ack::Outcome`], which becomes exactly one acknowledgment on the broker.
//!
//! The broker is reached through the traits in [`transport`]: [`channel`]
//! implements them over RabbitMQ, [`memory`] in-process.

mod consumer;
mod otel;

pub mod ack;
pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod routing;
pub mod topology;
pub mod transport;
