// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares queues and binds them to exchanges. Declarations are idempotent:
//! repeating one with the same parameters yields the same queue, while a
//! conflicting redeclaration is a [`DeclareError`].
//!
//! The main components are:
//! - `Topology` trait: builder interface for provisioning a set of components
//! - `AmqpTopology`: implementation over an [`AmqpChannel`], also used by
//!   each subscription to declare and bind its own queue

use crate::{
    errors::DeclareError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
    transport::AmqpChannel,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Builder interface for provisioning exchanges, queues and bindings.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares every exchange, then every queue, then every binding.
    async fn install(&self) -> Result<Vec<QueueHandle>, DeclareError>;
}

/// Topology declared through one channel.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Declares `def` and binds it with `binding`, returning the bound queue.
    pub async fn declare_and_bind(
        &self,
        def: &QueueDefinition,
        binding: &QueueBinding,
    ) -> Result<QueueHandle, DeclareError> {
        let queue = self.channel.declare_queue(def).await?;
        self.channel.bind_queue(binding).await?;

        debug!(
            queue = %queue.name,
            exchange = %binding.exchange_name,
            routing_key = %binding.routing_key,
            "queue was bound"
        );

        Ok(queue)
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition, replacing an earlier one with the same name.
    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|queue| queue.name != def.name);
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<Vec<QueueHandle>, DeclareError> {
        for exch in &self.exchanges {
            self.channel.declare_exchange(exch).await?;
        }

        let mut handles = Vec::with_capacity(self.queues.len());
        for def in &self.queues {
            handles.push(self.channel.declare_queue(def).await?);
        }

        for binding in &self.queues_binding {
            self.channel.bind_queue(binding).await?;
        }

        debug!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.queues_binding.len(),
            "topology installed"
        );

        Ok(handles)
    }
}
