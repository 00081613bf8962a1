//! Task publisher for the API side of the dispatch protocol.
//!
//! The publisher owns its broker connection explicitly: the first
//! operation establishes it, and any broker error drops the cached
//! connection so the next call reconnects. Broker unreachability is an
//! error value the caller handles, never a panic.

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::envelope::{HintMap, ResultEnvelope, TaskEnvelope};
use crate::queue::{QueueError, QueueNames, TaskQueue};

/// Errors surfaced to publisher callers.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker could not be reached; the caller decides whether to
    /// retry.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A broker operation failed after a connection was established.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Publishes prediction tasks and polls for results.
pub struct TaskPublisher {
    broker_url: String,
    names: QueueNames,
    queue: Option<TaskQueue>,
}

impl TaskPublisher {
    /// Creates a publisher. No connection is made until first use.
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            names: QueueNames::default(),
            queue: None,
        }
    }

    /// Overrides the channel names.
    pub fn with_names(mut self, names: QueueNames) -> Self {
        self.names = names;
        self
    }

    /// Returns the cached connection, establishing and declaring the
    /// channels on first use.
    async fn ensure_connected(&mut self) -> Result<&TaskQueue, PublishError> {
        if self.queue.is_none() {
            let queue = TaskQueue::connect(&self.broker_url, self.names.clone())
                .await
                .map_err(|e| PublishError::BrokerUnavailable(e.to_string()))?;
            queue.declare().await?;
            info!(broker = %self.broker_url, "Publisher connected to broker");
            self.queue = Some(queue);
        }

        Ok(self.queue.as_ref().expect("connection just established"))
    }

    /// Publishes a prediction task and returns its fresh correlation id.
    ///
    /// No validation happens here; the worker validates. The message is
    /// persistent and carries a server-assigned creation timestamp.
    pub async fn publish(
        &mut self,
        user_id: i64,
        event_id: i64,
        hints: HintMap,
    ) -> Result<Uuid, PublishError> {
        let task = TaskEnvelope::new(user_id, event_id, hints);
        let correlation_id = task.correlation_id;

        let queue = self.ensure_connected().await?;
        if let Err(e) = queue.publish_task(&task).await {
            // Drop the cached connection so the next call reconnects.
            warn!(error = %e, "Publish failed, discarding broker connection");
            self.queue = None;
            return Err(e.into());
        }

        info!(
            correlation_id = %correlation_id,
            user_id,
            event_id,
            priority = %task.priority,
            "Published prediction task"
        );
        Ok(correlation_id)
    }

    /// Fetches one result without blocking, or `None` if the results
    /// channel is empty.
    ///
    /// The fetch is destructive and unfiltered: callers waiting for a
    /// specific correlation id must loop and match ids themselves, and
    /// results fetched for other tasks are consumed regardless.
    pub async fn poll_result(&mut self) -> Result<Option<ResultEnvelope>, PublishError> {
        let queue = self.ensure_connected().await?;
        match queue.poll_result().await {
            Ok(result) => {
                if let Some(ref envelope) = result {
                    info!(
                        correlation_id = %envelope.correlation_id,
                        status = %envelope.status,
                        "Fetched result"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "Result poll failed, discarding broker connection");
                self.queue = None;
                Err(e.into())
            }
        }
    }

    /// Drops the cached broker connection.
    pub fn close(&mut self) {
        if self.queue.take().is_some() {
            info!("Publisher connection closed");
        }
    }

    /// Whether a broker connection is currently cached.
    pub fn is_connected(&self) -> bool {
        self.queue.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_starts_disconnected() {
        let publisher = TaskPublisher::new("redis://localhost:6379");
        assert!(!publisher.is_connected());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut publisher = TaskPublisher::new("redis://localhost:6379");
        publisher.close();
        publisher.close();
        assert!(!publisher.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_an_error_value() {
        // Reserved port with nothing listening; connection must fail fast
        // and come back as a value, not a panic.
        let mut publisher = TaskPublisher::new("redis://127.0.0.1:1/");
        let result = publisher.publish(1, 2, HintMap::new()).await;
        assert!(matches!(result, Err(PublishError::BrokerUnavailable(_))));
        assert!(!publisher.is_connected());
    }
}
