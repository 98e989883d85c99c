//! Routing, topology declaration and end-to-end publish/subscribe scenarios
//! against the in-memory broker.

mod common;

use std::sync::{Arc, Mutex};

use amqp_pubsub::{
    ack::Outcome,
    dispatcher::{Subscriber, SubscriptionDefinition},
    errors::{DeclareError, SubscribeError},
    handler::Handler,
    publisher::Publisher,
    queue::{DeadLetterConfig, QueueBinding, QueueDefinition},
    routing,
    topology::{AmqpTopology, Topology},
    transport::AmqpConnection,
};
use async_trait::async_trait;
use common::{
    wait_until, ArmyMove, GameLog, Harness, PlayingState, DEAD_LETTER_EXCHANGE,
    DEAD_LETTER_QUEUE, DIRECT_EXCHANGE, TOPIC_EXCHANGE,
};

fn recorder<T>(seen: Arc<Mutex<Vec<T>>>) -> impl Fn(T) -> Outcome + Send + Sync
where
    T: Send + 'static,
{
    move |message: T| {
        seen.lock().expect("recorder").push(message);
        Outcome::Ack
    }
}

#[tokio::test]
async fn topic_patterns_route_by_category() {
    let harness = Harness::new().await;
    let moves = Arc::new(Mutex::new(vec![]));
    let wars = Arc::new(Mutex::new(vec![]));

    let moves_def = SubscriptionDefinition::new(
        TOPIC_EXCHANGE,
        "army_moves.bob",
        &routing::category_pattern("army_moves"),
    )
    .transient();
    let _moves = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&moves_def, recorder(moves.clone()))
        .await
        .expect("subscribe");

    let wars_def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "war.*");
    let _wars = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&wars_def, recorder(wars.clone()))
        .await
        .expect("subscribe");

    harness
        .publisher
        .publish_json(
            TOPIC_EXCHANGE,
            &routing::key("army_moves", "alice"),
            &ArmyMove::new("alice", "europe"),
        )
        .await
        .expect("publish");

    wait_until(|| harness.stats("army_moves.bob").acked == 1).await;
    assert_eq!(
        moves.lock().expect("recorder").as_slice(),
        &[ArmyMove::new("alice", "europe")]
    );
    assert!(wars.lock().expect("recorder").is_empty());
    assert_eq!(harness.stats("war").ready, 0);
    assert_eq!(harness.stats("war").acked, 0);
}

#[tokio::test]
async fn pause_is_acknowledged_without_dead_lettering() {
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

    let states = Arc::new(Mutex::new(vec![]));
    let def = SubscriptionDefinition::new(DIRECT_EXCHANGE, "pause.bob", "pause.bob")
        .transient()
        .dead_letter(Some(DeadLetterConfig::new(DEAD_LETTER_EXCHANGE)));
    let sub = harness
        .subscriber
        .subscribe_json::<PlayingState, _>(&def, recorder(states.clone()))
        .await
        .expect("subscribe");
    assert_eq!(sub.queue().name, "pause.bob");

    let pause = PlayingState {
        kind: "pause".to_owned(),
        paused: true,
    };
    harness
        .publisher
        .publish_json(DIRECT_EXCHANGE, "pause.bob", &pause)
        .await
        .expect("publish");

    wait_until(|| harness.stats("pause.bob").acked == 1).await;

    assert_eq!(states.lock().expect("recorder").as_slice(), &[pause]);
    let stats = harness.stats("pause.bob");
    assert_eq!((stats.unacked, stats.discarded, stats.dead_lettered), (0, 0, 0));
    assert_eq!(harness.stats(DEAD_LETTER_QUEUE).ready, 0);
}

#[tokio::test]
async fn direct_exchange_requires_exact_keys() {
    let harness = Harness::new().await;
    let states = Arc::new(Mutex::new(vec![]));

    let def = SubscriptionDefinition::new(DIRECT_EXCHANGE, "pause.bob", "pause.bob").transient();
    let _sub = harness
        .subscriber
        .subscribe_json::<PlayingState, _>(&def, recorder(states.clone()))
        .await
        .expect("subscribe");

    let pause = PlayingState {
        kind: "pause".to_owned(),
        paused: true,
    };
    for key in ["pause.alice", "pause.*", "pause.bob"] {
        harness
            .publisher
            .publish_json(DIRECT_EXCHANGE, key, &pause)
            .await
            .expect("publish");
    }

    wait_until(|| harness.stats("pause.bob").acked == 1).await;
    assert_eq!(states.lock().expect("recorder").len(), 1);
}

#[tokio::test]
async fn declaring_twice_yields_the_same_queue() {
    let harness = Harness::new().await;
    let channel = harness.connection.create_channel().await.expect("channel");
    let topology = AmqpTopology::new(channel);

    let def = QueueDefinition::new("game_logs");
    let binding = QueueBinding::new("game_logs")
        .exchange(TOPIC_EXCHANGE)
        .routing_key("game_logs.*");

    let first = topology.declare_and_bind(&def, &binding).await.expect("first");
    let second = topology.declare_and_bind(&def, &binding).await.expect("second");
    assert_eq!(first.name, second.name);

    let logs = Arc::new(Mutex::new(vec![]));
    let sub_def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "game_logs", "game_logs.*");
    let _sub = harness
        .subscriber
        .subscribe_binary::<GameLog, _>(&sub_def, recorder(logs.clone()))
        .await
        .expect("subscribe on a pre-provisioned queue");

    harness
        .publisher
        .publish_binary(
            TOPIC_EXCHANGE,
            "game_logs.alice",
            &GameLog {
                username: "alice".to_owned(),
                message: "spawned in europe".to_owned(),
            },
        )
        .await
        .expect("publish");

    wait_until(|| harness.stats("game_logs").acked == 1).await;
    assert_eq!(logs.lock().expect("recorder").len(), 1);
}

#[tokio::test]
async fn conflicting_durability_fails_subscription_setup() {
    let harness = Harness::new().await;
    let durable = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "war.*");
    let _sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&durable, |_: ArmyMove| Outcome::Ack)
        .await
        .expect("subscribe");

    let err = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&durable.clone().transient(), |_: ArmyMove| {
            Outcome::Ack
        })
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SubscribeError::Declare(DeclareError::QueueConflict("war".to_owned()))
    );
}

#[tokio::test]
async fn transient_queues_belong_to_their_connection() {
    let harness = Harness::new().await;
    let def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "pause.bob", "pause.*").transient();
    let _sub = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(&def, |_: ArmyMove| Outcome::Ack)
        .await
        .expect("subscribe");

    let intruder = Subscriber::new(Arc::new(harness.broker.connect()));
    let err = intruder
        .subscribe_json::<ArmyMove, _>(&def, |_: ArmyMove| Outcome::Ack)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SubscribeError::Declare(DeclareError::QueueLocked("pause.bob".to_owned()))
    );

    harness.connection.close();
    assert!(!harness.broker.queue_exists("pause.bob"));
}

/// Resolves a war by logging it, then acknowledges the war message.
struct WarResolver {
    publisher: Arc<Publisher>,
}

#[async_trait]
impl Handler<ArmyMove> for WarResolver {
    async fn handle(&self, army: ArmyMove) -> Outcome {
        let log = GameLog {
            username: army.player.clone(),
            message: format!("{} won the war in {}", army.player, army.to),
        };
        let key = routing::key("game_logs", &army.player);

        match self.publisher.publish_binary(TOPIC_EXCHANGE, &key, &log).await {
            Ok(()) => Outcome::Ack,
            Err(_) => Outcome::NackRequeue,
        }
    }
}

#[tokio::test]
async fn handlers_can_publish_follow_up_messages() {
    let harness = Harness::new().await;
    let logs = Arc::new(Mutex::new(vec![]));

    let logs_def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "game_logs", "game_logs.*");
    let _logs = harness
        .subscriber
        .subscribe_binary::<GameLog, _>(&logs_def, recorder(logs.clone()))
        .await
        .expect("subscribe");

    let war_def = SubscriptionDefinition::new(TOPIC_EXCHANGE, "war", "war.*");
    let _war = harness
        .subscriber
        .subscribe_json::<ArmyMove, _>(
            &war_def,
            WarResolver {
                publisher: harness.publisher.clone(),
            },
        )
        .await
        .expect("subscribe");

    harness
        .publisher
        .publish_json(TOPIC_EXCHANGE, "war.alice", &ArmyMove::new("alice", "asia"))
        .await
        .expect("publish");

    wait_until(|| harness.stats("game_logs").acked == 1).await;
    assert_eq!(harness.stats("war").acked, 1);
    assert_eq!(
        logs.lock().expect("recorder").as_slice(),
        &[GameLog {
            username: "alice".to_owned(),
            message: "alice won the war in asia".to_owned(),
        }]
    );
}
