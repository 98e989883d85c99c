// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Resolves one delivery end to end: decode, hand to the typed handler, then
//! settle through the acknowledgment mapper. Payloads that fail to decode are
//! discarded without reaching the handler, since redelivering them could
//! never succeed.

use crate::{
    ack::{self, DeliveryState, Outcome},
    codec::Decoder,
    errors::AmqpError,
    handler::Handler,
    otel,
    transport::Delivery,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    KeyValue,
};
use std::borrow::Cow;
use tracing::{debug, warn};

/// Processes one delivery and returns the state it was settled in.
pub(crate) async fn consume<T>(
    tracer: &BoxedTracer,
    delivery: Delivery,
    decoder: &dyn Decoder<T>,
    handler: &dyn Handler<T>,
) -> Result<DeliveryState, AmqpError> {
    let (info, envelope, acker) = delivery.into_parts();

    let (_ctx, mut span) = otel::new_span(&envelope.headers, tracer, &info.routing_key);
    span.set_attribute(KeyValue::new("messaging.destination", info.exchange.clone()));
    span.set_attribute(KeyValue::new("messaging.redelivered", info.redelivered));

    debug!(
        routing_key = %info.routing_key,
        exchange = %info.exchange,
        delivery_tag = info.delivery_tag,
        "received message"
    );

    let outcome = match decoder.decode(&envelope) {
        Err(err) => {
            warn!(
                error = err.to_string(),
                routing_key = %info.routing_key,
                "discarding message - reason: undecodable payload"
            );
            span.record_error(&err);
            Outcome::NackDiscard
        }
        Ok(message) => handler.handle(message).await,
    };

    let result = ack::settle(acker, outcome).await;
    match &result {
        Ok(DeliveryState::Discarded) => span.set_status(Status::Error {
            description: Cow::from("message discarded"),
        }),
        Ok(_) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
        }
    }
    span.end();

    result
}
