//! Worker process: claims prediction tasks, scores them, and publishes
//! correlated results.
//!
//! Each worker is an independent process with a single-threaded
//! consumption loop; it holds at most one claimed task at a time, so a
//! slow prediction can never starve its own acknowledgements. Scaling is
//! horizontal: run more workers and the broker load-balances.
//!
//! Task lifecycle: claim, validate, extract features, predict, audit,
//! publish result, settle. Validation and extraction failures are
//! permanent, store errors included: the result says `failed` and the
//! claim is acknowledged. Unexpected errors past that point say `error`
//! and the claim is rejected without requeue, so a poisoned payload
//! cannot loop forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::envelope::{parse_task, ResultEnvelope, TaskEnvelope, TaskParseError};
use crate::features;
use crate::model::ParticipationModel;
use crate::queue::{QueueError, QueueNames, TaskQueue};
use crate::store::{FeatureStore, StoreError};

/// Errors that can occur inside a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Broker connection could not be established at startup.
    #[error("Broker connection failed after {attempts} attempts: {last_error}")]
    StartupConnection { attempts: u32, last_error: String },

    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A feature store query failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique identifier, stable across restarts of the same slot.
    pub worker_id: String,
    /// Broker connection URL.
    pub broker_url: String,
    /// Channel names to consume and produce on.
    pub queue_names: QueueNames,
    /// Blocking-claim timeout; also the idle poll cadence.
    pub poll_interval: Duration,
    /// Startup connection attempts before giving up.
    pub startup_attempts: u32,
    /// Fixed delay between startup attempts.
    pub startup_retry_delay: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, broker_url: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            broker_url: broker_url.into(),
            queue_names: QueueNames::default(),
            poll_interval: Duration::from_secs(1),
            startup_attempts: 10,
            startup_retry_delay: Duration::from_secs(5),
        }
    }

    pub fn with_queue_names(mut self, names: QueueNames) -> Self {
        self.queue_names = names;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = attempts.max(1);
        self
    }

    pub fn with_startup_retry_delay(mut self, delay: Duration) -> Self {
        self.startup_retry_delay = delay;
        self
    }
}

/// How a processed task should be settled on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Remove the claim; the task is done.
    Ack,
    /// Drop the claim without requeue.
    Reject,
}

/// The queue-independent half of the worker: validation, feature
/// extraction, prediction, audit logging, and result assembly.
///
/// Split out from the consumption loop so the full processing state
/// machine is exercisable against an in-memory store.
pub struct TaskProcessor {
    worker_id: String,
    store: Arc<dyn FeatureStore>,
    model: Box<dyn ParticipationModel>,
}

impl TaskProcessor {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn FeatureStore>,
        model: Box<dyn ParticipationModel>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            model,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs one task through the processing state machine.
    ///
    /// Always produces a result envelope; the settle decision encodes
    /// whether the failure was permanent-but-expected (ack) or an
    /// unexpected processing error (reject).
    pub async fn process(&self, task: &TaskEnvelope) -> (ResultEnvelope, Settle) {
        let started = Instant::now();
        let elapsed_ms = |s: Instant| s.elapsed().as_millis() as u64;

        // Validation: existence checks are permanent failures, and a
        // store error raised while performing them is caught and treated
        // the same way.
        let (user, event) = match self.resolve_subjects(task).await {
            Ok(pair) => pair,
            Err(reason) => {
                warn!(
                    worker_id = %self.worker_id,
                    correlation_id = %task.correlation_id,
                    reason = %reason,
                    "Task failed validation"
                );
                return (
                    ResultEnvelope::failed(
                        task.correlation_id,
                        reason,
                        &self.worker_id,
                        elapsed_ms(started),
                    ),
                    Settle::Ack,
                );
            }
        };

        // Feature extraction: an adapter error here is caught and the
        // task treated as failed, mirroring an empty vector.
        let transactions = match self.store.user_transactions(task.user_id).await {
            Ok(transactions) => transactions,
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    correlation_id = %task.correlation_id,
                    error = %e,
                    "Feature extraction failed"
                );
                return (
                    ResultEnvelope::failed(
                        task.correlation_id,
                        "Feature extraction failed",
                        &self.worker_id,
                        elapsed_ms(started),
                    ),
                    Settle::Ack,
                );
            }
        };

        let features = features::extract(&user, &event, &transactions, &task.hints);
        if features.is_empty() {
            return (
                ResultEnvelope::failed(
                    task.correlation_id,
                    "Feature extraction failed",
                    &self.worker_id,
                    elapsed_ms(started),
                ),
                Settle::Ack,
            );
        }

        let prediction = self.model.predict(&features);
        debug!(
            worker_id = %self.worker_id,
            correlation_id = %task.correlation_id,
            label = %prediction.label,
            confidence = prediction.confidence,
            "Prediction computed"
        );

        // Best-effort audit trail: a zero-amount transaction on the
        // subject user. Failures must never fail the task.
        let description = format!(
            "ML prediction: {} (confidence: {:.2}) for event {} by worker {}",
            prediction.label, prediction.confidence, task.event_id, self.worker_id
        );
        if let Err(e) = self
            .store
            .record_audit_entry(task.user_id, &description)
            .await
        {
            warn!(
                worker_id = %self.worker_id,
                correlation_id = %task.correlation_id,
                error = %e,
                "Audit entry write failed, continuing"
            );
        }

        let result = ResultEnvelope::completed(
            task,
            prediction,
            features.names(),
            &self.worker_id,
            elapsed_ms(started),
        );
        (result, Settle::Ack)
    }

    /// Looks up the subject user and event, mapping absence and store
    /// errors to a permanent validation failure reason.
    async fn resolve_subjects(
        &self,
        task: &TaskEnvelope,
    ) -> Result<(crate::store::User, crate::store::Event), String> {
        let user = self
            .store
            .get_user(task.user_id)
            .await
            .map_err(|e| format!("Validation error: {e}"))?
            .ok_or_else(|| format!("User {} not found", task.user_id))?;

        let event = self
            .store
            .get_event(task.event_id)
            .await
            .map_err(|e| format!("Validation error: {e}"))?
            .ok_or_else(|| format!("Event {} not found", task.event_id))?;

        Ok((user, event))
    }
}

/// A long-running worker bound to the broker.
pub struct Worker {
    config: WorkerConfig,
    queue: TaskQueue,
    processor: TaskProcessor,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    /// Connects to the broker with bounded retries, declares the
    /// channels, and recovers claims abandoned by a previous run of this
    /// worker id. Claims are bound to a per-worker list, so recovery
    /// never disturbs a sibling worker mid-task.
    pub async fn connect(
        config: WorkerConfig,
        store: Arc<dyn FeatureStore>,
        model: Box<dyn ParticipationModel>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self, WorkerError> {
        let mut last_error = String::new();
        let mut connected = None;

        for attempt in 1..=config.startup_attempts {
            match TaskQueue::connect(&config.broker_url, config.queue_names.clone()).await {
                Ok(queue) => {
                    connected = Some(queue);
                    break;
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        worker_id = %config.worker_id,
                        attempt,
                        max_attempts = config.startup_attempts,
                        error = %last_error,
                        "Broker connection attempt failed"
                    );
                    if attempt < config.startup_attempts {
                        tokio::time::sleep(config.startup_retry_delay).await;
                    }
                }
            }
        }

        let Some(queue) = connected else {
            return Err(WorkerError::StartupConnection {
                attempts: config.startup_attempts,
                last_error,
            });
        };
        let queue = queue.for_consumer(&config.worker_id);

        queue.declare().await?;

        match queue.recover_claimed().await {
            Ok(0) => {}
            Ok(recovered) => {
                info!(
                    worker_id = %config.worker_id,
                    recovered,
                    "Recovered abandoned task claims"
                );
            }
            Err(e) => {
                warn!(worker_id = %config.worker_id, error = %e, "Claim recovery failed");
            }
        }

        info!(worker_id = %config.worker_id, "Worker connected to broker");
        let processor = TaskProcessor::new(config.worker_id.clone(), store, model);
        Ok(Self {
            config,
            queue,
            processor,
            shutdown_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Main consumption loop: one task at a time until shutdown.
    pub async fn run(mut self) {
        info!(worker_id = %self.config.worker_id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.config.worker_id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.claim_task(self.config.poll_interval).await {
                Ok(Some(payload)) => {
                    self.handle_payload(&payload).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.config.worker_id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "Failed to claim task");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker stopped");
    }

    /// Processes one claimed payload and settles it on the broker.
    async fn handle_payload(&self, payload: &str) {
        let started = Instant::now();

        let task = match parse_task(payload) {
            Ok(task) => task,
            Err(TaskParseError::Malformed(reason)) => {
                // No correlation id could be extracted; nothing to answer.
                warn!(
                    worker_id = %self.config.worker_id,
                    reason = %reason,
                    "Dropping malformed task payload"
                );
                if let Err(e) = self.queue.reject(payload, &reason).await {
                    error!(worker_id = %self.config.worker_id, error = %e, "Failed to reject payload");
                }
                return;
            }
            Err(TaskParseError::Invalid {
                correlation_id,
                reason,
            }) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    correlation_id = %correlation_id,
                    reason = %reason,
                    "Task failed field validation"
                );
                let result = ResultEnvelope::failed(
                    correlation_id,
                    reason,
                    &self.config.worker_id,
                    started.elapsed().as_millis() as u64,
                );
                self.settle(payload, &result, Settle::Ack).await;
                return;
            }
        };

        info!(
            worker_id = %self.config.worker_id,
            correlation_id = %task.correlation_id,
            user_id = task.user_id,
            event_id = task.event_id,
            "Processing task"
        );

        let (result, settle) = self.processor.process(&task).await;

        info!(
            worker_id = %self.config.worker_id,
            correlation_id = %result.correlation_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            "Task processed"
        );

        self.settle(payload, &result, settle).await;
    }

    /// Publishes the result and settles the claim. An unexpected broker
    /// error while publishing converts the outcome to `error` and the
    /// claim is rejected without requeue.
    async fn settle(&self, payload: &str, result: &ResultEnvelope, settle: Settle) {
        if let Err(e) = self.queue.publish_result(result).await {
            error!(
                worker_id = %self.config.worker_id,
                correlation_id = %result.correlation_id,
                error = %e,
                "Failed to publish result"
            );
            let errored = ResultEnvelope::errored(
                result.correlation_id,
                format!("Result publish failed: {e}"),
                &self.config.worker_id,
                result.duration_ms,
            );
            // Second attempt is best-effort; the claim is dropped either way.
            let _ = self.queue.publish_result(&errored).await;
            if let Err(e) = self.queue.reject(payload, "result publish failed").await {
                error!(worker_id = %self.config.worker_id, error = %e, "Failed to reject payload");
            }
            return;
        }

        let settled = match settle {
            Settle::Ack => self.queue.ack(payload).await,
            Settle::Reject => {
                let reason = result
                    .error
                    .as_deref()
                    .unwrap_or("processing error")
                    .to_string();
                self.queue.reject(payload, &reason).await
            }
        };

        if let Err(e) = settled {
            error!(
                worker_id = %self.config.worker_id,
                correlation_id = %result.correlation_id,
                error = %e,
                "Failed to settle claim"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{HintMap, HintValue, TaskStatus};
    use crate::model::HeuristicModel;
    use crate::store::{Event, EventStatus, MemoryFeatureStore, Role, User};
    use chrono::{Duration as ChronoDuration, Utc};

    fn seeded_store() -> Arc<MemoryFeatureStore> {
        let store = MemoryFeatureStore::new();
        store.insert_user(User {
            id: 1,
            email: "alice@example.com".into(),
            balance: 1000.0,
            role: Role::Member,
            created_at: Utc::now() - ChronoDuration::days(90),
        });
        store.insert_event(Event {
            id: 2,
            title: "Hack night".into(),
            cost: 100.0,
            max_participants: Some(40),
            current_participants: 20,
            status: EventStatus::Active,
            event_date: Some(Utc::now() + ChronoDuration::days(10)),
            created_at: Utc::now() - ChronoDuration::days(3),
        });
        Arc::new(store)
    }

    fn processor(store: Arc<MemoryFeatureStore>) -> TaskProcessor {
        TaskProcessor::new("worker-test", store, Box::new(HeuristicModel::new()))
    }

    fn rich_hints() -> HintMap {
        let mut hints = HintMap::new();
        hints.insert("interest_level".into(), HintValue::Number(0.8));
        hints.insert("past_participation".into(), HintValue::Number(0.6));
        hints
    }

    #[tokio::test]
    async fn test_completed_task_carries_prediction() {
        let store = seeded_store();
        for _ in 0..6 {
            store.insert_transaction(1, 50.0);
        }
        let processor = processor(store.clone());
        let task = TaskEnvelope::new(1, 2, rich_hints());

        let (result, settle) = processor.process(&task).await;

        assert_eq!(settle, Settle::Ack);
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.correlation_id, task.correlation_id);
        assert_eq!(result.user_id, Some(1));
        assert_eq!(result.event_id, Some(2));
        assert_eq!(result.worker_id, "worker-test");
        assert!(!result.features_used.is_empty());

        // ratio 10 => base 0.8; +0.09 +0.06 +0.1 +0.1 => clamped 1.0
        let prediction = result.prediction.expect("prediction");
        assert_eq!(prediction.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_unknown_user_fails_permanently() {
        let processor = processor(seeded_store());
        let task = TaskEnvelope::new(999, 2, HintMap::new());

        let (result, settle) = processor.process(&task).await;

        assert_eq!(settle, Settle::Ack);
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap_or("").contains("999"));
        assert!(result.prediction.is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_fails_permanently() {
        let processor = processor(seeded_store());
        let task = TaskEnvelope::new(1, 888, HintMap::new());

        let (result, settle) = processor.process(&task).await;

        assert_eq!(settle, Settle::Ack);
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap_or("").contains("888"));
    }

    #[tokio::test]
    async fn test_store_error_is_permanent_failure() {
        let store = seeded_store();
        store.set_query_failure(true);
        let processor = processor(store.clone());
        let task = TaskEnvelope::new(1, 2, HintMap::new());

        let (result, settle) = processor.process(&task).await;

        // A store outage is caught and reported as a failed task, and
        // the claim is acknowledged so the payload does not redeliver.
        assert_eq!(settle, Settle::Ack);
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result
            .error
            .as_deref()
            .unwrap_or("")
            .contains("Validation error"));
        assert!(result.prediction.is_none());
        assert!(store.audit_entries(1).is_empty());
    }

    #[tokio::test]
    async fn test_audit_entry_recorded_on_completion() {
        let store = seeded_store();
        let processor = processor(store.clone());
        let task = TaskEnvelope::new(1, 2, HintMap::new());

        let (result, _) = processor.process(&task).await;
        assert_eq!(result.status, TaskStatus::Completed);

        let entries = store.audit_entries(1);
        assert_eq!(entries.len(), 1);
        let description = entries[0].description.as_deref().unwrap_or("");
        assert!(description.contains("ML prediction"));
        assert!(description.contains("event 2"));
        assert!(description.contains("worker-test"));
    }

    #[tokio::test]
    async fn test_audit_failure_is_swallowed() {
        let store = seeded_store();
        store.set_audit_failure(true);
        let processor = processor(store.clone());
        let task = TaskEnvelope::new(1, 2, HintMap::new());

        let (result, settle) = processor.process(&task).await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(settle, Settle::Ack);
        assert!(store.audit_entries(1).is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_writes_no_audit_entry() {
        let store = seeded_store();
        let processor = processor(store.clone());
        let task = TaskEnvelope::new(999, 2, HintMap::new());

        processor.process(&task).await;
        assert!(store.audit_entries(999).is_empty());
    }

    #[tokio::test]
    async fn test_result_echoes_correlation_id() {
        let processor = processor(seeded_store());
        for _ in 0..5 {
            let task = TaskEnvelope::new(1, 2, HintMap::new());
            let (result, _) = processor.process(&task).await;
            assert_eq!(result.correlation_id, task.correlation_id);
        }
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new("worker-7", "redis://localhost:6379")
            .with_poll_interval(Duration::from_secs(2))
            .with_startup_attempts(3)
            .with_startup_retry_delay(Duration::from_millis(10));

        assert_eq!(config.worker_id, "worker-7");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.startup_attempts, 3);
        assert_eq!(config.startup_retry_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_worker_config_floors_startup_attempts() {
        let config = WorkerConfig::new("w", "redis://localhost:6379").with_startup_attempts(0);
        assert_eq!(config.startup_attempts, 1);
    }

    #[tokio::test]
    async fn test_worker_startup_gives_up_after_bounded_retries() {
        let config = WorkerConfig::new("worker-x", "redis://127.0.0.1:1/")
            .with_startup_attempts(2)
            .with_startup_retry_delay(Duration::from_millis(1));
        let (_tx, rx) = broadcast::channel(1);

        let result = Worker::connect(
            config,
            seeded_store(),
            Box::new(HeuristicModel::new()),
            rx,
        )
        .await;

        match result {
            Err(WorkerError::StartupConnection { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected StartupConnection error, got {:?}", other.err()),
        }
    }
}
