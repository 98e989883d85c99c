//! Shared utilities for integration tests.
//!
//! Every test runs against its own in-memory broker provisioned with the
//! exchanges the game uses.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use amqp_pubsub::{
    dispatcher::Subscriber,
    exchange::ExchangeDefinition,
    memory::{MemoryBroker, MemoryConnection, QueueStats},
    publisher::Publisher,
};
use serde::{Deserialize, Serialize};

pub const TOPIC_EXCHANGE: &str = "peril_topic";
pub const DIRECT_EXCHANGE: &str = "peril_direct";
pub const DEAD_LETTER_EXCHANGE: &str = "peril_dlx";
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmyMove {
    pub player: String,
    pub to: String,
}

impl ArmyMove {
    pub fn new(player: &str, to: &str) -> Self {
        ArmyMove {
            player: player.to_owned(),
            to: to.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayingState {
    pub kind: String,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameLog {
    pub username: String,
    pub message: String,
}

/// Installs a fmt subscriber honoring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub connection: Arc<MemoryConnection>,
    pub subscriber: Subscriber,
    pub publisher: Arc<Publisher>,
}

impl Harness {
    pub async fn new() -> Harness {
        init_tracing();

        let broker = MemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDefinition::new(TOPIC_EXCHANGE).topic().durable())
            .expect("topic exchange");
        broker
            .declare_exchange(&ExchangeDefinition::new(DIRECT_EXCHANGE).direct().durable())
            .expect("direct exchange");
        broker
            .declare_exchange(&ExchangeDefinition::new(DEAD_LETTER_EXCHANGE).topic().durable())
            .expect("dead letter exchange");

        let connection = Arc::new(broker.connect());
        let subscriber = Subscriber::new(connection.clone());
        let publisher = Publisher::open(connection.as_ref())
            .await
            .expect("publisher channel");

        Harness {
            broker,
            connection,
            subscriber,
            publisher,
        }
    }

    pub fn stats(&self, queue: &str) -> QueueStats {
        self.broker.stats(queue).unwrap_or_default()
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
