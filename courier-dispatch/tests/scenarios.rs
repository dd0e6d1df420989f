//! End-to-end behaviour of the dispatch pipeline on a paused clock.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use courier_broker::{BrokerTransport, EnqueueOptions, EnqueueRecord, TestBroker};
use courier_common::Signal;
use courier_dispatch::{
    Clock, Consumer, DeliveryIntent, DispatchConfig, DispatchError, DispatchProcessor,
    InstantClock, Outcome, Publisher, ScheduleMode, Scheduler,
};
use courier_smtp::MailError;
use pretty_assertions::assert_eq;
use support::{LevelCounter, ScriptedMail};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PATIENCE: Duration = Duration::from_secs(3600);

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

fn config() -> DispatchConfig {
    DispatchConfig::new("noreply@example.com")
}

fn intent_of(record: &EnqueueRecord) -> DeliveryIntent {
    DeliveryIntent::decode(&record.payload).unwrap()
}

fn retries_published(broker: &TestBroker) -> Vec<u32> {
    broker
        .enqueued()
        .iter()
        .map(|record| intent_of(record).retries_remaining)
        .collect()
}

fn connection_error() -> MailError {
    MailError::Connection("Connection refused".to_string())
}

struct Harness {
    broker: TestBroker,
    mail: Arc<ScriptedMail>,
    publisher: Publisher,
    clock: Arc<InstantClock>,
    started: Instant,
    shutdown: broadcast::Sender<Signal>,
    server: JoinHandle<Result<(), DispatchError>>,
}

impl Harness {
    async fn start(config: DispatchConfig) -> Self {
        let broker = TestBroker::new();
        broker.bind(&config.topology).await.unwrap();

        let mail = ScriptedMail::new();
        let clock = Arc::new(InstantClock::new(origin()));
        let processor =
            DispatchProcessor::new(Arc::new(broker.clone()), mail.clone(), config, clock.clone());
        let publisher = processor.publisher().clone();

        let (shutdown, receiver) = broadcast::channel(4);
        let server = tokio::spawn(processor.serve(receiver));

        Self {
            broker,
            mail,
            publisher,
            clock,
            started: Instant::now(),
            shutdown,
            server,
        }
    }

    async fn stop(self) -> TestBroker {
        self.shutdown.send(Signal::Shutdown).unwrap();
        self.server.await.unwrap().unwrap();
        self.broker
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_connection_failures_then_delivery() {
    let harness = Harness::start(config()).await;
    harness
        .mail
        .fail_probes([connection_error(), connection_error()]);

    harness
        .publisher
        .publish_now("alice@example.com", "Welcome", "Hello Alice")
        .await
        .unwrap();
    harness.broker.wait_for_acks(3, PATIENCE).await.unwrap();

    assert_eq!(retries_published(&harness.broker), vec![3, 2, 1]);
    for record in &harness.broker.enqueued()[1..] {
        assert_eq!(
            record.options,
            EnqueueOptions::persistent().with_delay(Duration::from_secs(30))
        );
    }

    let sent = harness.mail.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(harness.mail.probe_count(), 3);
    assert!(sent[0].0 - harness.started >= Duration::from_secs(60));
    assert_eq!(sent[0].1.from, "noreply@example.com");
    assert_eq!(sent[0].1.to, "alice@example.com");
    assert_eq!(sent[0].1.subject, "Welcome");
    assert_eq!(sent[0].1.body, "Hello Alice");

    let broker = harness.stop().await;
    assert_eq!(broker.inner().len(), 0);
    assert_eq!(broker.inner().inflight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_last_retry_fails_then_discarded() {
    let mut config = config();
    config.default_retries = 1;
    let harness = Harness::start(config).await;
    harness
        .mail
        .fail_sends([MailError::Rejected("452 Mailbox full".to_string())]);

    harness
        .publisher
        .publish_now("alice@example.com", "Welcome", "Hello Alice")
        .await
        .unwrap();
    harness.broker.wait_for_acks(2, PATIENCE).await.unwrap();

    assert_eq!(retries_published(&harness.broker), vec![1, 0]);
    // One probe and one send for the first receipt, nothing for the second.
    assert_eq!(harness.mail.call_count(), 2);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_scheduled_send_waits_for_broker_delay() {
    let harness = Harness::start(config()).await;
    let at = harness.clock.now() + chrono::TimeDelta::minutes(2);

    harness
        .publisher
        .publish_later("alice@example.com", "Reminder", "Tea at noon", at)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(119)).await;
    assert_eq!(harness.mail.call_count(), 0);

    harness.broker.wait_for_acks(1, PATIENCE).await.unwrap();
    let sent = harness.mail.sent();
    assert_eq!(sent.len(), 1);
    let waited = sent[0].0 - harness.started;
    assert!(waited >= Duration::from_secs(120), "{waited:?}");
    assert!(waited < Duration::from_secs(121), "{waited:?}");

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_scheduled_send_waits_on_local_timer() {
    let mut config = config();
    config.schedule_mode = ScheduleMode::Consumer;
    let harness = Harness::start(config).await;
    let at = harness.clock.now() + chrono::TimeDelta::minutes(2);

    harness
        .publisher
        .publish_later("alice@example.com", "Reminder", "Tea at noon", at)
        .await
        .unwrap();
    assert_eq!(harness.broker.enqueued()[0].options.delay, None);

    tokio::time::sleep(Duration::from_secs(119)).await;
    assert_eq!(harness.mail.call_count(), 0);
    assert_eq!(harness.broker.ack_count(), 0);
    assert_eq!(harness.broker.inner().inflight_count(), 1);

    harness.broker.wait_for_acks(1, PATIENCE).await.unwrap();
    let sent = harness.mail.sent();
    assert_eq!(sent.len(), 1);
    let waited = sent[0].0 - harness.started;
    assert!(waited >= Duration::from_secs(120), "{waited:?}");
    assert!(waited < Duration::from_secs(121), "{waited:?}");
    assert_eq!(harness.broker.enqueue_count(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_schedule_already_past_is_immediate() {
    for mode in [ScheduleMode::Broker, ScheduleMode::Consumer] {
        let mut config = config();
        config.schedule_mode = mode;
        let harness = Harness::start(config).await;
        let at = harness.clock.now() - chrono::TimeDelta::minutes(5);

        harness
            .publisher
            .publish_later("alice@example.com", "Late", "Sorry", at)
            .await
            .unwrap();
        harness.broker.wait_for_acks(1, PATIENCE).await.unwrap();

        assert_eq!(harness.broker.enqueued()[0].options, EnqueueOptions::persistent());
        let sent = harness.mail.sent();
        assert_eq!(sent.len(), 1, "{mode:?}");
        assert!(sent[0].0 - harness.started < Duration::from_secs(1), "{mode:?}");

        harness.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_authentication_failure_is_discarded() {
    let counter = LevelCounter::default();
    let _guard = tracing_subscriber::registry()
        .with(counter.clone())
        .set_default();

    let harness = Harness::start(config()).await;
    harness.mail.fail_probes([MailError::Authentication(
        "535 5.7.8 Authentication credentials invalid".to_string(),
    )]);

    harness
        .publisher
        .publish_now("alice@example.com", "Welcome", "Hello Alice")
        .await
        .unwrap();
    harness.broker.wait_for_acks(1, PATIENCE).await.unwrap();

    assert_eq!(harness.broker.enqueue_count(), 1);
    assert!(harness.mail.sent().is_empty());
    assert_eq!(counter.count(tracing::Level::ERROR), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn authentication_failure_ignores_a_large_budget() {
    let mut config = config();
    config.default_retries = 50;
    let harness = Harness::start(config).await;
    harness
        .mail
        .fail_sends([MailError::Authentication("530 Authentication required".to_string())]);

    harness
        .publisher
        .publish_now("alice@example.com", "Welcome", "Hello Alice")
        .await
        .unwrap();
    harness.broker.wait_for_acks(1, PATIENCE).await.unwrap();

    // Give a stray requeue every chance to show up.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.broker.enqueue_count(), 1);
    assert_eq!(harness.broker.ack_count(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn budget_of_three_is_spent_after_three_failures() {
    let harness = Harness::start(config()).await;
    harness.mail.fail_probes([
        connection_error(),
        MailError::Protocol("Malformed reply".to_string()),
        MailError::Unexpected("Unexpected reply: 399".to_string()),
    ]);

    harness
        .publisher
        .publish_now("alice@example.com", "Welcome", "Hello Alice")
        .await
        .unwrap();
    harness.broker.wait_for_acks(4, PATIENCE).await.unwrap();

    assert_eq!(retries_published(&harness.broker), vec![3, 2, 1, 0]);
    assert_eq!(harness.mail.probe_count(), 3);
    assert!(harness.mail.sent().is_empty());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn requeued_copies_differ_only_in_the_counter() {
    let harness = Harness::start(config()).await;
    harness.mail.fail_sends([connection_error()]);
    let at = harness.clock.now() - chrono::TimeDelta::seconds(10);

    harness
        .publisher
        .publish_later("alice@example.com", "Grüße", "Line one\nLine two", at)
        .await
        .unwrap();
    harness.broker.wait_for_acks(2, PATIENCE).await.unwrap();

    let records = harness.broker.enqueued();
    let original = intent_of(&records[0]);
    let retried = intent_of(&records[1]);
    assert_eq!(retried.retries_remaining, original.retries_remaining - 1);
    assert_eq!(
        DeliveryIntent {
            retries_remaining: original.retries_remaining,
            ..retried
        },
        original
    );
    // The elapsed schedule does not hold the retry back a second time.
    assert_eq!(harness.mail.sent().len(), 2);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_intent_is_never_attempted() {
    let config = config();
    let destination = config.topology.destination();
    let harness = Harness::start(config).await;

    let later = DeliveryIntent::new("alice@example.com", "Hi", "Body", 0)
        .scheduled_for(harness.clock.now() + chrono::TimeDelta::hours(1));
    harness
        .broker
        .enqueue(&destination, later.encode().unwrap(), EnqueueOptions::persistent())
        .await
        .unwrap();
    harness.broker.wait_for_acks(1, PATIENCE).await.unwrap();

    assert_eq!(harness.mail.call_count(), 0);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_is_dropped() {
    let config = config();
    let destination = config.topology.destination();
    let harness = Harness::start(config).await;

    harness
        .broker
        .enqueue(&destination, b"not an intent".to_vec(), EnqueueOptions::persistent())
        .await
        .unwrap();
    harness
        .publisher
        .publish_now("alice@example.com", "Hi", "Body")
        .await
        .unwrap();
    harness.broker.wait_for_acks(2, PATIENCE).await.unwrap();

    assert_eq!(harness.mail.sent().len(), 1);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_requeue_leaves_the_original_unacknowledged() {
    let config = config();
    let queue = config.topology.queue.clone();
    let config = Arc::new(config);

    let broker = TestBroker::new();
    broker.bind(&config.topology).await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(InstantClock::new(origin()));
    let publisher = Publisher::new(Arc::new(broker.clone()), Arc::clone(&config), Arc::clone(&clock));
    let mail = ScriptedMail::new();
    mail.fail_probes([connection_error()]);
    let (scheduler, _fired) = Scheduler::spawn();
    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        mail,
        publisher.clone(),
        scheduler,
        Arc::clone(&config),
        clock,
    );

    publisher
        .publish_now("alice@example.com", "Hi", "Body")
        .await
        .unwrap();
    broker.fail_next_enqueues(1);

    let delivery = broker.receive(&queue).await.unwrap();
    let err = consumer.handle(delivery).await.unwrap_err();
    assert!(matches!(err, DispatchError::Enqueue(_)), "{err:?}");
    assert_eq!(broker.ack_count(), 0);
    assert_eq!(broker.inner().inflight_count(), 1);

    // Broker recovery hands it out again and the next attempt goes through.
    assert_eq!(broker.inner().recover(), 1);
    let delivery = broker.receive(&queue).await.unwrap();
    assert!(delivery.redelivered);
    let id = delivery.id;
    assert_eq!(consumer.handle(delivery).await.unwrap(), Outcome::Delivered);
    assert_eq!(broker.acked(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_deferred_messages_for_recovery() {
    let mut config = config();
    config.schedule_mode = ScheduleMode::Consumer;
    let harness = Harness::start(config).await;
    let at = harness.clock.now() + chrono::TimeDelta::hours(1);

    harness
        .publisher
        .publish_later("alice@example.com", "Later", "Body", at)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.broker.inner().inflight_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mail = Arc::clone(&harness.mail);
    let broker = harness.stop().await;

    assert_eq!(mail.call_count(), 0);
    assert_eq!(broker.ack_count(), 0);
    assert_eq!(broker.inner().inflight_count(), 1);
    assert_eq!(broker.inner().recover(), 1);
    assert_eq!(broker.inner().inflight_count(), 0);
    assert_eq!(broker.inner().len(), 1);
}
