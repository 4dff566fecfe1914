//! End-to-end scenario tests (S1–S6) against the in-memory fakes, exercising
//! `handle_message` and the `RetryManager`/`InMemoryRetryRepository` pair
//! without a live Kafka broker or Postgres instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kafka_retry_consumer::consumer::{handle_message, HandlerMap};
use kafka_retry_consumer::kafka::ConsumerMessage;
use kafka_retry_consumer::retry::{DbRetries, DbTopicRetry, Retry, RetryManager};
use kafka_retry_consumer::testkit::{FakeClock, InMemoryRetryRepository};
use kafka_retry_consumer::topic_chain::{DefaultTopicNameGenerator, TopicChain, TopicKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn chain() -> Arc<TopicChain> {
    Arc::new(
        TopicChain::new(
            "orders-svc",
            &["orders.created".to_string()],
            &[Duration::from_secs(30), Duration::from_secs(300)],
            Arc::new(DefaultTopicNameGenerator),
        )
        .unwrap(),
    )
}

fn sample_message() -> ConsumerMessage {
    ConsumerMessage {
        topic: "orders.created".to_string(),
        partition: 0,
        offset: 7,
        key: b"order-42".to_vec(),
        payload: b"{\"order_id\":42}".to_vec(),
        headers: HashMap::new(),
    }
}

// S1: a handler that succeeds emits no failure.
#[tokio::test]
async fn s1_successful_handler_marks_processed_without_failure() {
    let chain = chain();
    let mut handlers: HandlerMap = HashMap::new();
    handlers.insert(
        TopicKey::new("orders.created"),
        Arc::new(|_cancel, _msg| Box::pin(async { Ok(()) })),
    );

    let (tx, mut rx) = mpsc::channel(1);
    handle_message(&chain, &handlers, &tx, CancellationToken::new(), sample_message()).await;

    drop(tx);
    assert!(rx.recv().await.is_none());
}

// S2: a handler that fails emits a Failure addressed to the first retry link.
#[tokio::test]
async fn s2_failed_handler_emits_failure_to_first_retry_link() {
    let chain = chain();
    let mut handlers: HandlerMap = HashMap::new();
    handlers.insert(
        TopicKey::new("orders.created"),
        Arc::new(|_cancel, _msg| Box::pin(async { Err("downstream unavailable".to_string()) })),
    );

    let (tx, mut rx) = mpsc::channel(1);
    handle_message(&chain, &handlers, &tx, CancellationToken::new(), sample_message()).await;

    let failure = rx.recv().await.unwrap();
    assert_eq!(failure.next_topic, "retry1.orders-svc.orders.created");
    assert_eq!(failure.reason, "downstream unavailable");
    assert_eq!(failure.kafka_offset, 7);
}

fn db_retries() -> DbRetries {
    let mut map = DbRetries::new();
    map.insert(
        "orders.created".to_string(),
        vec![
            DbTopicRetry {
                interval: Duration::from_secs(30),
                sequence: 1,
                key: TopicKey::new("orders.created"),
            },
            DbTopicRetry {
                interval: Duration::from_secs(300),
                sequence: 2,
                key: TopicKey::new("orders.created"),
            },
        ],
    );
    map
}

// S3: a message that succeeds on its second attempt (the first configured DB
// retry) ends up Successful with Attempts = 2, not dead-lettered.
#[tokio::test]
async fn s3_eventual_success_clears_errored_state() {
    use kafka_retry_consumer::retry::RetryRepository;

    let clock = FakeClock::new(Utc::now());
    let repo = Arc::new(InMemoryRetryRepository::with_clock(clock.clone()));
    let failure = kafka_retry_consumer::Failure {
        reason: "first failure".to_string(),
        topic: "orders.created".to_string(),
        next_topic: "retry1.orders-svc.orders.created".to_string(),
        message: b"{}".to_vec(),
        message_key: b"key".to_vec(),
        message_headers: HashMap::new(),
        kafka_partition: 0,
        kafka_offset: 0,
    };
    repo.publish_failure(&failure).await.unwrap();

    let manager = RetryManager::new(repo.clone(), db_retries());

    // The row was published at attempts = 1 (the main-topic attempt that
    // already failed), so the first DB tier (sequence = 1) is the one that
    // picks it up.
    let batch = manager.get_batch("orders.created", 1, Duration::ZERO).await.unwrap();
    assert_eq!(batch.len(), 1);
    manager.mark_successful(batch.into_iter().next().unwrap()).await.unwrap();

    let row = repo.snapshot().into_iter().next().unwrap();
    assert_eq!(row.attempts, 2);
    assert!(row.successful);
    assert!(!row.errored);
    assert!(!row.deadlettered);
}

// S4: a message that keeps failing through every configured tier is
// dead-lettered once the last tier's attempt also errors, ending at
// Attempts = 3 for two configured tiers.
#[tokio::test]
async fn s4_exhausted_retries_are_dead_lettered() {
    use kafka_retry_consumer::retry::RetryRepository;

    let repo = Arc::new(InMemoryRetryRepository::with_clock(FakeClock::new(Utc::now())));
    let failure = kafka_retry_consumer::Failure {
        reason: "first failure".to_string(),
        topic: "orders.created".to_string(),
        next_topic: "retry1.orders-svc.orders.created".to_string(),
        message: b"{}".to_vec(),
        message_key: b"key".to_vec(),
        message_headers: HashMap::new(),
        kafka_partition: 0,
        kafka_offset: 0,
    };
    repo.publish_failure(&failure).await.unwrap();

    let manager = RetryManager::new(repo.clone(), db_retries());

    let first = manager.get_batch("orders.created", 1, Duration::ZERO).await.unwrap();
    assert_eq!(first.len(), 1);
    manager
        .mark_errored(first.into_iter().next().unwrap(), "second failure")
        .await
        .unwrap();

    let second = manager.get_batch("orders.created", 2, Duration::ZERO).await.unwrap();
    assert_eq!(second.len(), 1);
    manager
        .mark_errored(second.into_iter().next().unwrap(), "third failure")
        .await
        .unwrap();

    let row = repo.snapshot().into_iter().next().unwrap();
    assert_eq!(row.attempts, 3);
    assert!(row.errored);
    assert!(row.deadlettered);
    assert_eq!(row.last_error.as_deref(), Some("third failure"));
}

// S5: concurrent batch leases never return the same row to two callers, and
// a stale lease (retry_started_at far in the past, retry_finished_at unset)
// is reclaimed on the next poll.
#[tokio::test]
async fn s5_concurrent_leases_never_double_claim_a_row() {
    let clock = FakeClock::new(Utc::now());
    let repo = Arc::new(InMemoryRetryRepository::with_clock(clock.clone()));

    for i in 0..20 {
        let failure = kafka_retry_consumer::Failure {
            reason: "boom".to_string(),
            topic: "orders.created".to_string(),
            next_topic: "retry1.orders-svc.orders.created".to_string(),
            message: b"{}".to_vec(),
            message_key: format!("key-{i}").into_bytes(),
            message_headers: HashMap::new(),
            kafka_partition: 0,
            kafka_offset: i,
        };
        use kafka_retry_consumer::retry::RetryRepository;
        repo.publish_failure(&failure).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            use kafka_retry_consumer::retry::RetryRepository;
            repo.get_messages_for_retry("orders.created", 1, Duration::ZERO)
                .await
                .unwrap()
        }));
    }

    let mut all_ids = Vec::new();
    for handle in handles {
        let batch = handle.await.unwrap();
        all_ids.extend(batch.into_iter().map(|r| r.id));
    }

    let mut seen = std::collections::HashSet::new();
    for id in &all_ids {
        assert!(seen.insert(*id), "row {id} was leased more than once");
    }
    assert_eq!(all_ids.len(), 20);
}

// S6: maintenance only deletes rows that are both successful and older than
// the retention window; errored or recent rows are untouched.
#[tokio::test]
async fn s6_maintenance_only_purges_old_successful_rows() {
    let clock = FakeClock::new(Utc::now());
    let repo = InMemoryRetryRepository::with_clock(clock.clone());

    let old_successful = Retry {
        id: 1,
        topic: "orders.created".to_string(),
        payload_json: Vec::new(),
        payload_headers: serde_json::json!({}),
        payload_key: None,
        kafka_offset: 0,
        kafka_partition: 0,
        attempts: 1,
        errored: false,
        deadlettered: false,
        successful: true,
        last_error: None,
        batch_id: None,
        retry_started_at: None,
        retry_finished_at: None,
        created_at: clock.now() - chrono::Duration::hours(2),
        updated_at: clock.now() - chrono::Duration::hours(2),
    };
    let recent_successful = Retry {
        id: 2,
        updated_at: clock.now(),
        ..old_successful.clone()
    };
    let errored_row = Retry {
        id: 3,
        successful: false,
        errored: true,
        updated_at: clock.now() - chrono::Duration::hours(2),
        ..old_successful.clone()
    };

    repo.seed(old_successful);
    repo.seed(recent_successful);
    repo.seed(errored_row);

    let manager = RetryManager::new(repo, db_retries());
    let deleted = manager.run_maintenance(&clock).await.unwrap();

    assert_eq!(deleted, 1);
}
