//! Consume loop behavior against the in-memory broker: prefetch backpressure,
//! sequential settlement, requeue, dead-lettering and decode failures.

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use amqp_pubsub::{
    ack::Outcome,
    codec::{Envelope, JSON_CONTENT_TYPE},
    dispatcher::SubscriptionDefinition,
    handler::Handler,
    queue::{DeadLetterConfig, QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
    transport::{AmqpChannel, AmqpConnection},
};
use async_trait::async_trait;
use common::{
    wait_until, ArmyMove, Harness, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, TOPIC_EXCHANGE,
};
use tokio::sync::Semaphore;

/// Blocks every message until a permit is released.
struct Gated {
    permits: Arc<Semaphore>,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler<ArmyMove> for Gated {
    async fn handle(&self, _message: ArmyMove) -> Outcome {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.permits
            .acquire()
            .await
            .expect("semaphore open")
            .forget();
        Outcome::Ack
    }
}

/// Never finishes handling.
struct Stuck;

#[async_trait]
impl Handler<ArmyMove> for Stuck {
    async fn handle(&self, _message: ArmyMove) -> Outcome {
        std::future::pending::<Outcome>().await
    }
}

async fn publish_moves(harness: &Harness, count: usize) {
    for n in 0..count {
        harness
            .publisher
            .publish_json(
                TOPIC_EXCHANGE,
                "army_moves.alice",
                &ArmyMove::new("alice", &n.to_string()),
            )
            .await
            .expect("publish");
    }
}

#[tokio::test]
async fn prefetch_bounds_outstanding_deliveries() {
    let harness = Harness::new().await;
    let permits = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));

    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "army_moves.bob", "army_moves.*")
        .transient()
        .prefetch(2);
    let handler = Gated {
        permits: permits.clone(),
        started: started.clone(),
    };
    let _sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&def, handler)
        .await
        .expect("subscribe");

    publish_moves(&harness, 5).await;

    wait_until(|| harness.stats("army_moves.bob").unacked == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = harness.stats("army_moves.bob");
    assert_eq!((stats.unacked, stats.ready, stats.acked), (2, 3, 0));
    assert_eq!(started.load(Ordering::SeqCst), 1);

    permits.add_permits(1);
    wait_until(|| harness.stats("army_moves.bob").acked == 1).await;
    let stats = harness.stats("army_moves.bob");
    assert_eq!((stats.unacked, stats.ready), (2, 2));

    permits.add_permits(4);
    wait_until(|| harness.stats("army_moves.bob").acked == 5).await;
    assert_eq!(harness.stats("army_moves.bob").unacked, 0);
    assert_eq!(started.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn a_stalled_subscription_does_not_block_others() {
    let harness = Harness::new().await;
    let stalled = SubscriptionDefinition::new(TOPIC_EXCHANGE, "army_moves.bob", "army_moves.*")
        .transient()
        .prefetch(1);
    let _stalled = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(
            &stalled,
            Gated {
                permits: Arc::new(Semaphore::new(0)),
                started: Arc::new(AtomicUsize::new(0)),
            },
        )
        .await
        .expect("subscribe");

    let live = SubscriptionDefinition::new(TOPIC_EXCHANGE, "army_moves.carol", "army_moves.*")
        .transient()
        .prefetch(1);
    let _live = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&live, |_: ArmyMove| Outcome::Ack)
        .await
        .expect("subscribe");

    publish_moves(&harness, 3).await;

    wait_until(|| harness.stats("army_moves.carol").acked == 3).await;
    assert_eq!(harness.stats("army_moves.bob").acked, 0);
}

#[tokio::test]
async fn deliveries_settle_before_the_next_is_handled() {
    let harness = Harness::new().await;
    let broker = harness.broker.clone();
    let observed = Arc::new(Mutex::new(vec![]));

    let recorder = observed.clone();
    let handler = move |army: ArmyMove| {
        let acked = broker.stats("war").map_or(0, |stats| stats.acked);
        recorder.lock().expect("recorder").push((army.to, acked));
        Outcome::Ack
    };

    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "army_moves.*").prefetch(10);
    let _sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&def, handler)
        .await
        .expect("subscribe");

    publish_moves(&harness, 4).await;
    wait_until(|| harness.stats("war").acked == 4).await;

    let observed = observed.lock().expect("recorder").clone();
    let expected: Vec<(String, u64)> = (0..4).map(|n| (n.to_string(), n)).collect();
    assert_eq!(observed, expected);
}

#[tokio::test]
async fn requeued_messages_are_redelivered() {
    let harness = Harness::new().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let handler = move |_: ArmyMove| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Outcome::NackRequeue
        } else {
            Outcome::Ack
        }
    };

    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "army_moves.*");
    let _sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&def, handler)
        .await
        .expect("subscribe");

    publish_moves(&harness, 1).await;
    wait_until(|| harness.stats("war").acked == 1).await;

    let stats = harness.stats("war");
    assert_eq!((stats.requeued, stats.discarded), (1, 0));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn discarded_messages_reach_the_dead_letter_queue() {
    let harness = Harness::new().await;
    let channel = harness.connection.create_channel().await.expect("channel");
    AmqpTopology::new(channel)
        .queue(QueueDefinition::new(DEAD_LETTER_QUEUE))
        .queue_binding(
            QueueBinding::new(DEAD_LETTER_QUEUE)
                .exchange(DEAD_LETTER_EXCHANGE)
                .routing_key("#"),
        )
        .install()
        .await
        .expect("install");

    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "army_moves.*")
        .dead_letter(Some(DeadLetterConfig::new(DEAD_LETTER_EXCHANGE)));
    let _sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&def, |_: ArmyMove| Outcome::NackDiscard)
        .await
        .expect("subscribe");

    publish_moves(&harness, 2).await;
    wait_until(|| harness.stats(DEAD_LETTER_QUEUE).ready == 2).await;

    let stats = harness.stats("war");
    assert_eq!((stats.discarded, stats.dead_lettered, stats.acked), (2, 2, 0));
}

#[tokio::test]
async fn undecodable_payloads_are_discarded_without_handling() {
    let harness = Harness::new().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let handler = move |_: ArmyMove| {
        counter.fetch_add(1, Ordering::SeqCst);
        Outcome::Ack
    };

    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "army_moves.*");
    let _sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&def, handler)
        .await
        .expect("subscribe");

    let raw = harness.connection.create_channel().await.expect("channel");
    raw.publish(
        TOPIC_EXCHANGE,
        "army_moves.alice",
        Envelope::new(JSON_CONTENT_TYPE, b"{\"player\":".to_vec()),
    )
    .await
    .expect("publish");
    harness
        .publisher
        .publish_binary(TOPIC_EXCHANGE, "army_moves.alice", &ArmyMove::new("alice", "asia"))
        .await
        .expect("publish");
    publish_moves(&harness, 1).await;

    wait_until(|| harness.stats("war").acked == 1).await;

    let stats = harness.stats("war");
    assert_eq!(stats.discarded, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closing_the_connection_ends_the_subscription() {
    let harness = Harness::new().await;
    let permits = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));

    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "army_moves.*");
    let sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(
            &def,
            Gated {
                permits: permits.clone(),
                started: started.clone(),
            },
        )
        .await
        .expect("subscribe");

    publish_moves(&harness, 1).await;
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    harness.connection.close();
    permits.add_permits(1);

    tokio::time::timeout(Duration::from_secs(2), sub.closed())
        .await
        .expect("consume loop ended");

    let stats = harness.stats("war");
    assert_eq!((stats.ready, stats.unacked, stats.acked), (1, 0, 0));
}

#[tokio::test]
async fn aborted_subscriptions_return_deliveries_when_the_connection_closes() {
    let harness = Harness::new().await;
    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "army_moves.*").prefetch(1);
    let sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&def, Stuck)
        .await
        .expect("subscribe");

    publish_moves(&harness, 1).await;
    wait_until(|| harness.stats("war").unacked == 1).await;

    sub.abort();
    wait_until(|| sub.is_finished()).await;
    publish_moves(&harness, 1).await;

    harness.connection.close();

    let stats = harness.stats("war");
    assert_eq!((stats.ready, stats.unacked), (2, 0));
}
