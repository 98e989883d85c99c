// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Typed Message Handlers
//!
//! A handler receives a decoded payload and answers with an [`Outcome`]. It
//! is never called concurrently within one subscription. Plain closures work
//! for synchronous handlers; implement the trait for handlers that await,
//! for instance to publish follow-up messages before answering.

use crate::ack::Outcome;
use async_trait::async_trait;

#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, message: T) -> Outcome;
}

#[async_trait]
impl<T, F> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Outcome + Send + Sync,
{
    async fn handle(&self, message: T) -> Outcome {
        self(message)
    }
}
