//! Integration tests for the dispatch pipeline.
//!
//! The wire-level tests run against a real Redis broker.
//! Run with: EVENTCAST_TEST_REDIS_URL=redis://localhost:6379/ cargo test --test pipeline -- --ignored

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use eventcast::envelope::{parse_task, HintMap, HintValue, TaskStatus};
use eventcast::model::HeuristicModel;
use eventcast::queue::{QueueNames, TaskQueue};
use eventcast::store::{Event, EventStatus, MemoryFeatureStore, Role, User};
use eventcast::worker::{Settle, TaskProcessor};
use eventcast::{TaskEnvelope, TaskPublisher};

fn get_test_broker_url() -> String {
    std::env::var("EVENTCAST_TEST_REDIS_URL")
        .expect("EVENTCAST_TEST_REDIS_URL environment variable must be set for integration tests")
}

/// Channel names namespaced per test so runs never interfere.
fn test_names(tag: &str) -> QueueNames {
    QueueNames {
        tasks: format!("test:{tag}:tasks"),
        results: format!("test:{tag}:results"),
    }
}

fn seeded_store() -> Arc<MemoryFeatureStore> {
    let store = MemoryFeatureStore::new();
    store.insert_user(User {
        id: 10,
        email: "organizer@example.com".into(),
        balance: 500.0,
        role: Role::Member,
        created_at: Utc::now() - ChronoDuration::days(120),
    });
    store.insert_event(Event {
        id: 20,
        title: "Summer meetup".into(),
        cost: 50.0,
        max_participants: Some(100),
        current_participants: 40,
        status: EventStatus::Active,
        event_date: Some(Utc::now() + ChronoDuration::days(14)),
        created_at: Utc::now() - ChronoDuration::days(7),
    });
    Arc::new(store)
}

#[tokio::test]
async fn test_wire_payload_round_trips_through_processor() {
    // A payload serialized by the publisher side must parse and process
    // on the worker side without loss.
    let mut hints = HintMap::new();
    hints.insert("interest_level".into(), HintValue::Number(0.9));
    hints.insert("priority".into(), HintValue::Text("high".into()));
    let task = TaskEnvelope::new(10, 20, hints);
    let payload = serde_json::to_string(&task).expect("serialize");

    let parsed = parse_task(&payload).expect("parse");
    assert_eq!(parsed.correlation_id, task.correlation_id);
    assert_eq!(parsed.user_id, 10);
    assert_eq!(parsed.event_id, 20);

    let processor = TaskProcessor::new("worker-it", seeded_store(), Box::new(HeuristicModel::new()));
    let (result, settle) = processor.process(&parsed).await;

    assert_eq!(settle, Settle::Ack);
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.correlation_id, task.correlation_id);
    assert!(result.is_success());

    let prediction = result.prediction.expect("prediction");
    assert!((0.0..=1.0).contains(&prediction.confidence));
    assert!(!prediction.signals.is_empty());
}

#[tokio::test]
async fn test_result_envelope_survives_wire_serialization() {
    let processor = TaskProcessor::new("worker-it", seeded_store(), Box::new(HeuristicModel::new()));
    let task = TaskEnvelope::new(10, 20, HintMap::new());
    let (result, _) = processor.process(&task).await;

    let json = serde_json::to_string(&result).expect("serialize");
    let decoded: eventcast::ResultEnvelope = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(decoded.correlation_id, result.correlation_id);
    assert_eq!(decoded.status, TaskStatus::Completed);
    assert_eq!(decoded.worker_id, "worker-it");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test pipeline -- --ignored
async fn test_declare_is_idempotent() {
    let queue = TaskQueue::connect(&get_test_broker_url(), test_names("declare"))
        .await
        .expect("connect");
    queue.purge().await.expect("purge");

    queue.declare().await.expect("first declare");
    queue.declare().await.expect("second declare");

    queue.purge().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_publish_claim_ack_lifecycle() {
    let queue = TaskQueue::connect(&get_test_broker_url(), test_names("lifecycle"))
        .await
        .expect("connect");
    queue.purge().await.expect("purge");
    queue.declare().await.expect("declare");

    let task = TaskEnvelope::new(10, 20, HintMap::new());
    queue.publish_task(&task).await.expect("publish");
    assert_eq!(queue.task_depth().await.expect("depth"), 1);

    let payload = queue
        .claim_task(Duration::from_secs(1))
        .await
        .expect("claim")
        .expect("a task should be available");
    assert_eq!(queue.task_depth().await.expect("depth"), 0);
    assert_eq!(queue.claimed_depth().await.expect("depth"), 1);

    let claimed = parse_task(&payload).expect("parse");
    assert_eq!(claimed.correlation_id, task.correlation_id);

    queue.ack(&payload).await.expect("ack");
    assert_eq!(queue.claimed_depth().await.expect("depth"), 0);

    queue.purge().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_reject_moves_payload_to_dead_letter() {
    let queue = TaskQueue::connect(&get_test_broker_url(), test_names("reject"))
        .await
        .expect("connect");
    queue.purge().await.expect("purge");
    queue.declare().await.expect("declare");

    queue.publish_task(&TaskEnvelope::new(10, 20, HintMap::new()))
        .await
        .expect("publish");
    let payload = queue
        .claim_task(Duration::from_secs(1))
        .await
        .expect("claim")
        .expect("task");

    queue.reject(&payload, "test rejection").await.expect("reject");

    assert_eq!(queue.claimed_depth().await.expect("depth"), 0);
    assert_eq!(queue.task_depth().await.expect("depth"), 0);
    assert_eq!(queue.dead_letter_depth().await.expect("depth"), 1);

    queue.purge().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_recover_claimed_requeues_abandoned_tasks() {
    let queue = TaskQueue::connect(&get_test_broker_url(), test_names("recover"))
        .await
        .expect("connect");
    queue.purge().await.expect("purge");
    queue.declare().await.expect("declare");

    queue.publish_task(&TaskEnvelope::new(10, 20, HintMap::new()))
        .await
        .expect("publish");
    let _claimed = queue
        .claim_task(Duration::from_secs(1))
        .await
        .expect("claim")
        .expect("task");

    // Simulate a crash: the claim is never settled.
    let recovered = queue.recover_claimed().await.expect("recover");
    assert_eq!(recovered, 1);
    assert_eq!(queue.task_depth().await.expect("depth"), 1);
    assert_eq!(queue.claimed_depth().await.expect("depth"), 0);

    queue.purge().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_sibling_startup_recovery_leaves_live_claims_invisible() {
    let names = test_names("sibling");
    let broker_url = get_test_broker_url();
    let worker_one = TaskQueue::connect(&broker_url, names.clone())
        .await
        .expect("connect")
        .for_consumer("worker-1");
    worker_one.purge().await.expect("purge");
    worker_one.declare().await.expect("declare");

    worker_one
        .publish_task(&TaskEnvelope::new(10, 20, HintMap::new()))
        .await
        .expect("publish");
    let payload = worker_one
        .claim_task(Duration::from_secs(1))
        .await
        .expect("claim")
        .expect("task");

    // A second worker starting while the first is mid-task recovers only
    // its own claimed list; the live claim must stay invisible.
    let worker_two = TaskQueue::connect(&broker_url, names.clone())
        .await
        .expect("connect")
        .for_consumer("worker-2");
    assert_eq!(worker_two.recover_claimed().await.expect("recover"), 0);
    assert_eq!(worker_one.task_depth().await.expect("depth"), 0);
    assert_eq!(worker_one.claimed_depth().await.expect("depth"), 1);

    worker_one.ack(&payload).await.expect("ack");
    assert_eq!(worker_one.claimed_depth().await.expect("depth"), 0);

    // A restart under the same id does recover its own abandoned claim.
    worker_one
        .publish_task(&TaskEnvelope::new(10, 20, HintMap::new()))
        .await
        .expect("publish");
    let _abandoned = worker_one
        .claim_task(Duration::from_secs(1))
        .await
        .expect("claim")
        .expect("task");
    let restarted = TaskQueue::connect(&broker_url, names)
        .await
        .expect("connect")
        .for_consumer("worker-1");
    assert_eq!(restarted.recover_claimed().await.expect("recover"), 1);
    assert_eq!(restarted.task_depth().await.expect("depth"), 1);

    restarted.purge().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_poll_result_is_destructive_and_unfiltered() {
    let names = test_names("poll");
    let broker_url = get_test_broker_url();
    let queue = TaskQueue::connect(&broker_url, names.clone())
        .await
        .expect("connect");
    queue.purge().await.expect("purge");
    queue.declare().await.expect("declare");

    let task = TaskEnvelope::new(10, 20, HintMap::new());
    let result = eventcast::ResultEnvelope::failed(
        task.correlation_id,
        "User 10 not found",
        "worker-it",
        3,
    );
    queue.publish_result(&result).await.expect("publish result");

    let mut publisher = TaskPublisher::new(&broker_url).with_names(names);
    let fetched = publisher
        .poll_result()
        .await
        .expect("poll")
        .expect("a result should be available");
    assert_eq!(fetched.correlation_id, task.correlation_id);
    assert_eq!(fetched.status, TaskStatus::Failed);

    // The fetch consumed the result; a second poll comes back empty.
    assert!(publisher.poll_result().await.expect("poll").is_none());

    queue.purge().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_publisher_end_to_end_with_worker_processor() {
    let names = test_names("e2e");
    let broker_url = get_test_broker_url();
    let queue = TaskQueue::connect(&broker_url, names.clone())
        .await
        .expect("connect");
    queue.purge().await.expect("purge");

    let mut hints = HintMap::new();
    hints.insert("interest_level".into(), HintValue::Number(0.7));
    let mut publisher = TaskPublisher::new(&broker_url).with_names(names);
    let correlation_id = publisher.publish(10, 20, hints).await.expect("publish");

    // Stand in for a worker: claim, process, publish the result, ack.
    let payload = queue
        .claim_task(Duration::from_secs(1))
        .await
        .expect("claim")
        .expect("task");
    let task = parse_task(&payload).expect("parse");
    assert_eq!(task.correlation_id, correlation_id);

    let processor = TaskProcessor::new("worker-it", seeded_store(), Box::new(HeuristicModel::new()));
    let (result, settle) = processor.process(&task).await;
    assert_eq!(settle, Settle::Ack);
    queue.publish_result(&result).await.expect("publish result");
    queue.ack(&payload).await.expect("ack");

    let fetched = publisher
        .poll_result()
        .await
        .expect("poll")
        .expect("result");
    assert_eq!(fetched.correlation_id, correlation_id);
    assert_eq!(fetched.status, TaskStatus::Completed);
    assert_eq!(fetched.user_id, Some(10));
    assert_eq!(fetched.event_id, Some(20));

    queue.purge().await.expect("cleanup");
}
