// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Mapping
//!
//! Handlers answer with an [`Outcome`]; this module turns that verdict into
//! the one broker action a delivery receives. The acker is taken by value, so
//! a delivery cannot be settled twice.

use crate::{errors::AmqpError, transport::DeliveryAcker};
use std::fmt;
use tracing::{debug, error};

/// A handler's verdict on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Processed; remove it from the queue.
    Ack,
    /// Put it back for redelivery. For transient or ordering-dependent failures.
    NackRequeue,
    /// Drop it, or dead-letter it when the queue has a dead letter exchange.
    /// For payloads that can never succeed.
    NackDiscard,
}

/// Terminal state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    Acknowledged,
    Requeued,
    Discarded,
}

impl From<Outcome> for DeliveryState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Ack => DeliveryState::Acknowledged,
            Outcome::NackRequeue => DeliveryState::Requeued,
            Outcome::NackDiscard => DeliveryState::Discarded,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Acknowledged => write!(f, "acknowledged"),
            DeliveryState::Requeued => write!(f, "requeued"),
            DeliveryState::Discarded => write!(f, "discarded"),
        }
    }
}

/// Issues the broker action for `outcome`.
///
/// A failing action is logged and returned, never retried: the broker then
/// decides the fate of the still-unacknowledged message.
pub async fn settle(
    acker: Box<dyn DeliveryAcker>,
    outcome: Outcome,
) -> Result<DeliveryState, AmqpError> {
    let result = match outcome {
        Outcome::Ack => acker.ack().await,
        Outcome::NackRequeue => acker.nack(true).await,
        Outcome::NackDiscard => acker.nack(false).await,
    };

    let state = DeliveryState::from(outcome);
    match result {
        Ok(()) => {
            debug!(state = %state, "message settled");
            Ok(state)
        }
        Err(err) => {
            error!(error = err.to_string(), state = %state, "failure to settle message");
            Err(err)
        }
    }
}
