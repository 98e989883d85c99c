// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A single-process broker implementing the transport traits with the AMQP
//! semantics the pipeline relies on:
//! - direct and topic exchanges, plus the default exchange routing by queue name
//! - durable queues shared by every connection, transient queues exclusive to
//!   the declaring connection and deleted when it closes
//! - per-consumer prefetch, manual ack/nack, requeue at the head of the queue
//!   flagged as redelivered
//! - dead-lettering of discarded and overflowing (`x-max-length`) messages;
//!   an overflow cycle that would bring a message back to a queue it already
//!   overflowed from drops it instead
//! - unacknowledged deliveries requeued when their channel or connection closes
//!
//! Message TTL is accepted as a declaration argument but not enforced.

use crate::{
    codec::Envelope,
    errors::{AmqpError, DeclareError, PublishError, SubscribeError},
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition, QueueHandle},
    transport::{AmqpChannel, AmqpConnection, Delivery, DeliveryAcker, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Counters and gauges of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be delivered.
    pub ready: usize,
    /// Messages delivered and not yet settled.
    pub unacked: usize,
    pub consumers: usize,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    /// Messages moved to the dead letter exchange, by discard or overflow.
    pub dead_lettered: u64,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
    redelivered: bool,
    /// Queues the message was dead-lettered from, oldest first.
    deaths: Vec<Death>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Death {
    queue: String,
    reason: DeathReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeathReason {
    Rejected,
    MaxLength,
}

impl Message {
    /// A dead-letter cycle with no rejection in it would never end.
    fn completes_cycle(&self, queue: &str, reason: DeathReason) -> bool {
        reason != DeathReason::Rejected
            && self.deaths.iter().any(|death| death.queue == queue)
            && self
                .deaths
                .iter()
                .all(|death| death.reason != DeathReason::Rejected)
    }
}

struct Consumer {
    tag: String,
    connection: u64,
    channel: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
    flags: ChannelFlags,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        let unlimited = self.prefetch == 0;
        !self.sender.is_closed() && (unlimited || self.in_flight < usize::from(self.prefetch))
    }
}

struct Unacked {
    consumer: String,
    connection: u64,
    channel: u64,
    message: Message,
}

struct QueueState {
    def: QueueDefinition,
    owner: Option<u64>,
    bindings: Vec<(String, String)>,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    next_tag: u64,
    stats: QueueStats,
}

impl QueueState {
    fn new(def: &QueueDefinition, owner: Option<u64>) -> Self {
        QueueState {
            def: def.clone(),
            owner,
            bindings: vec![],
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: vec![],
            next_consumer: 0,
            next_tag: 1,
            stats: QueueStats::default(),
        }
    }

    fn is_equivalent(&self, def: &QueueDefinition) -> bool {
        self.def.durability == def.durability && self.def.arguments() == def.arguments()
    }

    fn accessible_from(&self, connection: u64) -> bool {
        self.owner.map_or(true, |owner| owner == connection)
    }

    fn handle(&self) -> QueueHandle {
        QueueHandle {
            name: self.def.name.clone(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            unacked: self.unacked.len(),
            consumers: self.consumers.len(),
            ..self.stats
        }
    }

    /// Picks the next consumer with prefetch capacity, round robin.
    fn next_available(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        let start = self.next_consumer;
        let idx = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&idx| self.consumers[idx].has_capacity())?;
        self.next_consumer = (idx + 1) % count;
        Some(idx)
    }

    fn consumer_mut(&mut self, tag: &str) -> Option<&mut Consumer> {
        self.consumers.iter_mut().find(|consumer| consumer.tag == tag)
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    next_connection: u64,
    next_channel: u64,
}

/// Closed flags a delivery checks before settling.
#[derive(Clone)]
struct ChannelFlags {
    channel: Arc<AtomicBool>,
    connection: Arc<AtomicBool>,
}

impl ChannelFlags {
    fn is_closed(&self) -> bool {
        self.channel.load(Ordering::SeqCst) || self.connection.load(Ordering::SeqCst)
    }
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-process broker. Clones share the same exchanges and queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: SharedState,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an exchange, the way an operator provisions one.
    pub fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), DeclareError> {
        lock(&self.state).declare_exchange(def)
    }

    /// Opens a new connection to the broker.
    pub fn connect(&self) -> MemoryConnection {
        let id = {
            let mut state = lock(&self.state);
            state.next_connection += 1;
            state.next_connection
        };

        MemoryConnection {
            id,
            state: self.state.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether `queue` is declared; transient queues disappear with their
    /// connection.
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    /// A snapshot of the counters of `queue`, if it exists.
    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        lock(&self.state).queues.get(queue).map(QueueState::snapshot)
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    state: SharedState,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Closes the connection: its consumers are cancelled, their unacked
    /// deliveries requeued, and the transient queues it owns deleted.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = lock(&self.state);
        let id = self.id;
        state.queues.retain(|_, queue| queue.owner != Some(id));
        state.cancel_consumers(&self.state, Scope::Connection(id));

        debug!(connection = id, "connection closed");
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        let id = {
            let mut state = lock(&self.state);
            state.next_channel += 1;
            state.next_channel
        };

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            state: self.state.clone(),
            prefetch: AtomicU16::new(0),
            flags: ChannelFlags {
                channel: Arc::new(AtomicBool::new(false)),
                connection: self.closed.clone(),
            },
        }))
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    state: SharedState,
    prefetch: AtomicU16,
    flags: ChannelFlags,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.flags.is_closed() {
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), DeclareError> {
        self.ensure_open()?;
        lock(&self.state).declare_exchange(def)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueHandle, DeclareError> {
        self.ensure_open()?;

        let mut state = lock(&self.state);
        if let Some(queue) = state.queues.get(&def.name) {
            if !queue.accessible_from(self.connection) {
                return Err(DeclareError::QueueLocked(def.name.clone()));
            }
            if !queue.is_equivalent(def) {
                return Err(DeclareError::QueueConflict(def.name.clone()));
            }
            return Ok(queue.handle());
        }

        let owner = def.durability.exclusive().then_some(self.connection);
        let queue = QueueState::new(def, owner);
        let handle = queue.handle();
        state.queues.insert(def.name.clone(), queue);

        debug!(queue = %def.name, connection = self.connection, "queue declared");
        Ok(handle)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), DeclareError> {
        self.ensure_open()?;

        let mut state = lock(&self.state);
        if !state.exchanges.contains_key(&binding.exchange_name) {
            return Err(DeclareError::ExchangeNotFound(binding.exchange_name.clone()));
        }

        let Some(queue) = state.queues.get_mut(&binding.queue_name) else {
            return Err(DeclareError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
                "queue not found".to_owned(),
            ));
        };
        if !queue.accessible_from(self.connection) {
            return Err(DeclareError::QueueLocked(binding.queue_name.clone()));
        }

        let entry = (binding.exchange_name.clone(), binding.routing_key.clone());
        if !queue.bindings.contains(&entry) {
            queue.bindings.push(entry);
        }

        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), SubscribeError> {
        self.ensure_open()
            .map_err(|err| SubscribeError::QoSDeclarationError(err.to_string()))?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, SubscribeError> {
        self.ensure_open()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.state);
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(SubscribeError::BindingConsumerError(
                    queue.to_owned(),
                    "queue not found".to_owned(),
                ));
            };
            if !target.accessible_from(self.connection) {
                return Err(SubscribeError::BindingConsumerError(
                    queue.to_owned(),
                    "queue is locked by another connection".to_owned(),
                ));
            }

            target.consumers.push(Consumer {
                tag: consumer_tag.to_owned(),
                connection: self.connection,
                channel: self.id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                in_flight: 0,
                sender,
                flags: self.flags.clone(),
            });
            state.dispatch(&self.state, queue);
        }

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });

        Ok(deliveries.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), PublishError> {
        let failure = |reason: &str| PublishError::PublishingError {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            reason: reason.to_owned(),
        };

        if self.flags.is_closed() {
            return Err(failure("channel closed"));
        }

        let mut state = lock(&self.state);
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(failure("exchange not found"));
        }

        state.route(
            &self.state,
            Message {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                envelope,
                redelivered: false,
                deaths: vec![],
            },
        );

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.flags.channel.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let id = self.id;
        lock(&self.state).cancel_consumers(&self.state, Scope::Channel(id));

        debug!(channel = id, "channel closed");
        Ok(())
    }
}

impl BrokerState {
    fn declare_exchange(&mut self, def: &ExchangeDefinition) -> Result<(), DeclareError> {
        match self.exchanges.get(&def.name) {
            Some(kind) if *kind != def.kind => Err(DeclareError::DeclareExchangeError(
                def.name.clone(),
                "inequivalent exchange kind".to_owned(),
            )),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(def.name.clone(), def.kind);
                Ok(())
            }
        }
    }

    /// Copies `message` into every queue bound to its exchange with a
    /// matching key. Unroutable messages are dropped.
    fn route(&mut self, shared: &SharedState, message: Message) {
        let targets: Vec<String> = if message.exchange.is_empty() {
            self.queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let Some(kind) = self.exchanges.get(&message.exchange).copied() else {
                warn!(
                    exchange = %message.exchange,
                    "dropping message - reason: exchange not found"
                );
                return;
            };
            self.queues
                .iter()
                .filter(|(_, queue)| {
                    queue.bindings.iter().any(|(exchange, pattern)| {
                        *exchange == message.exchange && kind.routes(pattern, &message.routing_key)
                    })
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "message unroutable"
            );
            return;
        }

        for name in targets {
            self.enqueue(shared, &name, message.clone());
        }
    }

    fn enqueue(&mut self, shared: &SharedState, name: &str, message: Message) {
        let mut overflow = vec![];
        if let Some(queue) = self.queues.get_mut(name) {
            queue.ready.push_back(message);
            if let Some(max) = queue.def.max_length {
                let max = usize::try_from(max).unwrap_or(0);
                while queue.ready.len() > max {
                    if let Some(oldest) = queue.ready.pop_front() {
                        overflow.push(oldest);
                    }
                }
            }
        }

        for message in overflow {
            self.dead_letter(shared, name, message, DeathReason::MaxLength);
        }
        self.dispatch(shared, name);
    }

    /// Reroutes a message rejected by `queue` to its dead letter exchange,
    /// if it has one.
    fn dead_letter(
        &mut self,
        shared: &SharedState,
        queue: &str,
        mut message: Message,
        reason: DeathReason,
    ) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(dlx) = state.def.dead_letter.clone() else {
            return;
        };
        if message.completes_cycle(queue, reason) {
            warn!(
                queue = %queue,
                exchange = %dlx.exchange,
                "dropping message - reason: dead letter cycle"
            );
            return;
        }
        state.stats.dead_lettered += 1;

        message.deaths.push(Death {
            queue: queue.to_owned(),
            reason,
        });
        message.exchange = dlx.exchange;
        if let Some(key) = dlx.routing_key {
            message.routing_key = key;
        }
        message.redelivered = false;
        self.route(shared, message);
    }

    /// Pushes ready messages to consumers while they have prefetch capacity.
    fn dispatch(&mut self, shared: &SharedState, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        queue.consumers.retain(|consumer| !consumer.sender.is_closed());

        while !queue.ready.is_empty() {
            let Some(idx) = queue.next_available() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            let tag = queue.next_tag;
            queue.next_tag += 1;

            let consumer = &mut queue.consumers[idx];
            let delivery = Delivery::new(
                tag,
                &message.exchange,
                &message.routing_key,
                message.redelivered,
                message.envelope.clone(),
                Box::new(MemoryAcker {
                    state: shared.clone(),
                    queue: name.to_owned(),
                    delivery_tag: tag,
                    flags: consumer.flags.clone(),
                }),
            );

            if consumer.sender.send(delivery).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                queue.next_consumer = 0;
                continue;
            }

            consumer.in_flight += 1;
            let unacked = Unacked {
                consumer: consumer.tag.clone(),
                connection: consumer.connection,
                channel: consumer.channel,
                message,
            };
            queue.unacked.insert(tag, unacked);
        }
    }

    /// Removes the consumers in `scope` everywhere, ending their streams, and
    /// requeues every delivery the scope still holds. Deliveries of consumers
    /// already gone, for instance after their stream was dropped, count too.
    fn cancel_consumers(&mut self, shared: &SharedState, scope: Scope) {
        let names: Vec<String> = self.queues.keys().cloned().collect();

        for name in names {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };

            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|consumer| !scope.covers(consumer.connection, consumer.channel));
            let cancelled = queue.consumers.len() != before;
            if cancelled {
                queue.next_consumer = 0;
            }

            let mut orphaned: Vec<(u64, Message)> = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| scope.covers(unacked.connection, unacked.channel))
                .map(|(tag, unacked)| (*tag, unacked.message.clone()))
                .collect();
            if !cancelled && orphaned.is_empty() {
                continue;
            }
            orphaned.sort_by_key(|(tag, _)| *tag);

            for (tag, mut message) in orphaned.into_iter().rev() {
                queue.unacked.remove(&tag);
                message.redelivered = true;
                queue.ready.push_front(message);
            }

            self.dispatch(shared, &name);
        }
    }

    fn settle(&mut self, shared: &SharedState, name: &str, tag: u64, action: Settlement) -> bool {
        let Some(queue) = self.queues.get_mut(name) else {
            return false;
        };
        let Some(unacked) = queue.unacked.remove(&tag) else {
            return false;
        };
        if let Some(consumer) = queue.consumer_mut(&unacked.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        let mut message = unacked.message;
        match action {
            Settlement::Ack => queue.stats.acked += 1,
            Settlement::Requeue => {
                queue.stats.requeued += 1;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settlement::Discard => {
                queue.stats.discarded += 1;
                self.dead_letter(shared, name, message, DeathReason::Rejected);
            }
        }

        self.dispatch(shared, name);
        true
    }
}

/// What a close reclaims.
#[derive(Debug, Clone, Copy)]
enum Scope {
    Channel(u64),
    Connection(u64),
}

impl Scope {
    fn covers(&self, connection: u64, channel: u64) -> bool {
        match *self {
            Scope::Channel(id) => channel == id,
            Scope::Connection(id) => connection == id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    Discard,
}

struct MemoryAcker {
    state: SharedState,
    queue: String,
    delivery_tag: u64,
    flags: ChannelFlags,
}

impl MemoryAcker {
    fn settle(&self, action: Settlement) -> Result<(), String> {
        if self.flags.is_closed() {
            return Err("channel closed".to_owned());
        }

        let settled = lock(&self.state).settle(&self.state, &self.queue, self.delivery_tag, action);
        if !settled {
            return Err(format!("unknown delivery tag {}", self.delivery_tag));
        }

        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(Settlement::Ack).map_err(AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if requeue {
            self.settle(Settlement::Requeue)
                .map_err(AmqpError::RequeuingMessageError)
        } else {
            self.settle(Settlement::Discard)
                .map_err(AmqpError::NackMessageError)
        }
    }
}
