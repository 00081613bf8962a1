//! Redis-backed task and results channels.
//!
//! Two durable lists carry the dispatch protocol: pending prediction
//! tasks and finished results. Claiming a task atomically moves it to a
//! claimed list with BRPOPLPUSH, so a worker that dies mid-task leaves
//! the payload recoverable instead of lost. Settling a claim either
//! removes it (ack) or moves it to a dead-letter list (reject without
//! requeue).
//!
//! # Key layout
//!
//! - `{tasks}`: pending task payloads
//! - `{tasks}:claimed:{consumer}`: payloads currently held by one consumer
//! - `{tasks}:dead_letter`: rejected payloads kept for inspection
//! - `{results}`: unread result payloads
//! - `{tasks}:declared`: registry set making declaration idempotent
//!
//! Each consumer claims into its own list (see
//! [`for_consumer`](TaskQueue::for_consumer)), so one worker recovering
//! its abandoned claims on startup can never requeue a sibling's live
//! claim.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

use crate::envelope::{ResultEnvelope, TaskEnvelope};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// Broker operation failed.
    #[error("Broker operation failed: {0}")]
    Broker(#[from] redis::RedisError),

    /// Failed to serialize or deserialize an envelope.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Names of the two channels a queue instance operates on.
#[derive(Debug, Clone)]
pub struct QueueNames {
    pub tasks: String,
    pub results: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            tasks: "prediction_tasks".to_string(),
            results: "prediction_results".to_string(),
        }
    }
}

/// The broker-side half of the dispatch protocol.
///
/// One instance per process; the connection manager handles reconnection
/// internally and is never shared across threads by this crate.
pub struct TaskQueue {
    redis: ConnectionManager,
    tasks: String,
    claimed: String,
    dead_letter: String,
    results: String,
    registry: String,
}

impl TaskQueue {
    /// Connects to the broker and binds to the named channels.
    pub async fn connect(broker_url: &str, names: QueueNames) -> Result<Self, QueueError> {
        let client = redis::Client::open(broker_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, names))
    }

    /// Creates a queue from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, names: QueueNames) -> Self {
        Self {
            redis,
            claimed: format!("{}:claimed", names.tasks),
            dead_letter: format!("{}:dead_letter", names.tasks),
            registry: format!("{}:declared", names.tasks),
            tasks: names.tasks,
            results: names.results,
        }
    }

    /// Binds claims to a consumer-private claimed list.
    ///
    /// A consumer id must be stable across restarts of the same slot, so
    /// that [`recover_claimed`](Self::recover_claimed) finds exactly the
    /// claims the previous run of that slot abandoned and nothing held by
    /// a live sibling.
    pub fn for_consumer(mut self, consumer_id: &str) -> Self {
        self.claimed = consumer_claimed_list(&self.tasks, consumer_id);
        self
    }

    /// Declares both channels. Idempotent: declaring an existing channel
    /// is a no-op and never disturbs pending messages.
    pub async fn declare(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(&self.registry, &self.tasks).await?;
        conn.sadd::<_, _, ()>(&self.registry, &self.results).await?;
        Ok(())
    }

    /// Publishes a task to the tasks channel.
    ///
    /// The payload's own identifier is its correlation id; the list is
    /// durable across broker restarts.
    pub async fn publish_task(&self, task: &TaskEnvelope) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.tasks, payload).await?;
        Ok(())
    }

    /// Claims the next task, blocking up to `timeout`.
    ///
    /// The raw payload is moved atomically to the claimed list; exactly
    /// one consumer receives each payload. The claim stays invisible to
    /// other workers until settled with [`ack`](Self::ack) or
    /// [`reject`](Self::reject), and is returned to the tasks channel by
    /// [`recover_claimed`](Self::recover_claimed) if the holder dies.
    pub async fn claim_task(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let payload: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.tasks)
            .arg(&self.claimed)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(payload)
    }

    /// Acknowledges a claimed payload: the task is done and will never be
    /// redelivered.
    pub async fn ack(&self, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(&self.claimed, 1, payload).await?;
        Ok(())
    }

    /// Negatively acknowledges a claimed payload without requeueing it.
    ///
    /// The payload leaves the delivery path permanently; a dead-letter
    /// entry keeps it inspectable.
    pub async fn reject(&self, payload: &str, reason: &str) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "payload": payload,
            "reason": reason,
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.claimed, 1, payload)
            .lpush(&self.dead_letter, &serialized);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Publishes a result to the results channel.
    pub async fn publish_result(&self, result: &ResultEnvelope) -> Result<(), QueueError> {
        let payload = serde_json::to_string(result)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.results, payload).await?;
        Ok(())
    }

    /// Fetches one result without blocking, or `None` if the channel is
    /// empty.
    ///
    /// The fetch is destructive regardless of whether the caller wanted
    /// this particular correlation id.
    pub async fn poll_result(&self) -> Result<Option<ResultEnvelope>, QueueError> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.rpop(&self.results, None).await?;

        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Returns payloads stuck on this consumer's claimed list to the
    /// tasks channel.
    ///
    /// Called on worker startup; this is the redelivery half of
    /// at-least-once. Only the bound claimed list is touched, so claims
    /// held by other live consumers stay invisible. Returns the number of
    /// payloads recovered.
    pub async fn recover_claimed(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let stuck: Vec<String> = conn.lrange(&self.claimed, 0, -1).await?;
        let mut recovered = 0;

        for payload in stuck {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.claimed, 1, &payload)
                .rpush(&self.tasks, &payload);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Number of pending tasks.
    pub async fn task_depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.tasks).await?)
    }

    /// Number of claimed, unsettled tasks across all consumers.
    pub async fn claimed_depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn.keys(format!("{}:claimed*", self.tasks)).await?;

        let mut depth = 0usize;
        for key in keys {
            let len: usize = conn.llen(key).await?;
            depth += len;
        }
        Ok(depth)
    }

    /// Number of dead-lettered tasks.
    pub async fn dead_letter_depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.dead_letter).await?)
    }

    /// Number of unread results.
    pub async fn result_depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.results).await?)
    }

    /// Snapshot of all channel depths.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, claimed, dead_lettered, unread_results) = tokio::try_join!(
            self.task_depth(),
            self.claimed_depth(),
            self.dead_letter_depth(),
            self.result_depth()
        )?;

        Ok(QueueStats {
            tasks_channel: self.tasks.clone(),
            results_channel: self.results.clone(),
            pending,
            claimed,
            dead_lettered,
            unread_results,
        })
    }

    /// Deletes all channel contents, including every consumer's claimed
    /// list. Test and operator tooling only.
    pub async fn purge(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let claimed: Vec<String> = conn.keys(format!("{}:claimed*", self.tasks)).await?;

        let mut pipe = redis::pipe();
        pipe.del(&self.tasks)
            .del(&self.dead_letter)
            .del(&self.results)
            .del(&self.registry);
        for key in &claimed {
            pipe.del(key);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Name of the tasks channel.
    pub fn tasks_channel(&self) -> &str {
        &self.tasks
    }

    /// Name of the results channel.
    pub fn results_channel(&self) -> &str {
        &self.results
    }

    /// Name of the claimed list this instance settles against.
    pub fn claimed_channel(&self) -> &str {
        &self.claimed
    }
}

fn consumer_claimed_list(tasks: &str, consumer_id: &str) -> String {
    format!("{tasks}:claimed:{consumer_id}")
}

/// Snapshot of channel depths.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub tasks_channel: String,
    pub results_channel: String,
    pub pending: usize,
    pub claimed: usize,
    pub dead_lettered: usize,
    pub unread_results: usize,
}

impl QueueStats {
    /// Total task payloads in any state on the broker.
    pub fn total_tasks(&self) -> usize {
        self.pending + self.claimed + self.dead_lettered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{HintMap, TaskEnvelope};

    #[test]
    fn test_queue_names_default() {
        let names = QueueNames::default();
        assert_eq!(names.tasks, "prediction_tasks");
        assert_eq!(names.results, "prediction_results");
    }

    #[test]
    fn test_consumer_claimed_lists_are_private() {
        let a = consumer_claimed_list("prediction_tasks", "worker-1");
        let b = consumer_claimed_list("prediction_tasks", "worker-2");

        assert_eq!(a, "prediction_tasks:claimed:worker-1");
        assert_ne!(a, b);
        // Both remain under the shared prefix so pool-wide depth and
        // purge still see them.
        assert!(a.starts_with("prediction_tasks:claimed"));
        assert!(b.starts_with("prediction_tasks:claimed"));
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            tasks_channel: "prediction_tasks".into(),
            results_channel: "prediction_results".into(),
            pending: 4,
            claimed: 2,
            dead_lettered: 1,
            unread_results: 3,
        };
        assert_eq!(stats.total_tasks(), 7);
    }

    #[test]
    fn test_task_payload_roundtrip() {
        let task = TaskEnvelope::new(1, 2, HintMap::new());
        let payload = serde_json::to_string(&task).expect("serialize");
        let parsed: TaskEnvelope = serde_json::from_str(&payload).expect("deserialize");
        assert_eq!(parsed.correlation_id, task.correlation_id);
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let entry = serde_json::json!({
            "payload": "{}",
            "reason": "malformed payload",
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });

        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&entry).expect("serialize"))
                .expect("parse back");
        assert!(parsed.get("payload").is_some());
        assert!(parsed.get("reason").is_some());
        assert!(parsed.get("moved_at").is_some());
    }
}
