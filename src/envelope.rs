//! Message schema for the prediction dispatch pipeline.
//!
//! This module defines the envelopes that travel between the publisher,
//! the broker, and the workers:
//!
//! - `TaskEnvelope`: one prediction request, identified by a correlation id
//! - `ResultEnvelope`: the outcome of one request, carrying the same id
//! - `Prediction`: the scored outcome embedded in a completed result
//! - `HintValue`: a typed scalar supplied by the caller as a feature hint

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Informational priority label carried on a task. Does not affect
/// delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Parses a priority label, falling back to `Normal` for anything
    /// unrecognized.
    pub fn parse(label: &str) -> Self {
        match label {
            "low" => Priority::Low,
            "high" => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// A typed scalar feature hint supplied by the caller.
///
/// Untagged so that plain JSON scalars (`0.8`, `"concert"`, `true`)
/// deserialize directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HintValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl HintValue {
    /// Numeric view of the hint. Flags map to 0/1; text falls back to
    /// the supplied default.
    pub fn as_number(&self, default: f64) -> f64 {
        match self {
            HintValue::Number(n) => *n,
            HintValue::Flag(true) => 1.0,
            HintValue::Flag(false) => 0.0,
            HintValue::Text(_) => default,
        }
    }

    /// Text view of the hint, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HintValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for HintValue {
    fn from(n: f64) -> Self {
        HintValue::Number(n)
    }
}

impl From<bool> for HintValue {
    fn from(b: bool) -> Self {
        HintValue::Flag(b)
    }
}

impl From<&str> for HintValue {
    fn from(s: &str) -> Self {
        HintValue::Text(s.to_string())
    }
}

/// Caller-supplied feature hints keyed by name.
pub type HintMap = BTreeMap<String, HintValue>;

/// Looks up a numeric hint with an explicit default.
pub fn hint_number(hints: &HintMap, name: &str, default: f64) -> f64 {
    hints.get(name).map_or(default, |v| v.as_number(default))
}

/// A prediction request published to the tasks queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Correlation id linking this task to its eventual result.
    /// Assigned once by the publisher, never reused.
    pub correlation_id: Uuid,
    /// Subject user.
    pub user_id: i64,
    /// Subject event.
    pub event_id: i64,
    /// Caller-supplied feature hints.
    #[serde(default)]
    pub hints: HintMap,
    /// Publisher-assigned creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Informational priority label.
    #[serde(default)]
    pub priority: Priority,
}

impl TaskEnvelope {
    /// Creates a new task with a fresh correlation id.
    ///
    /// The priority label is read from the `priority` hint when present.
    pub fn new(user_id: i64, event_id: i64, hints: HintMap) -> Self {
        let priority = hints
            .get("priority")
            .and_then(HintValue::as_text)
            .map(Priority::parse)
            .unwrap_or_default();

        Self {
            correlation_id: Uuid::new_v4(),
            user_id,
            event_id,
            hints,
            created_at: Utc::now(),
            priority,
        }
    }

    /// Overrides the priority label.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// How long ago the task was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Why a raw task payload could not be turned into a `TaskEnvelope`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskParseError {
    /// The payload is not valid JSON, or carries no usable correlation id.
    /// No result can be correlated, so none is produced.
    Malformed(String),
    /// The payload has a correlation id but a required field is missing
    /// or mistyped. Permanent; reported via a `failed` result.
    Invalid {
        correlation_id: Uuid,
        reason: String,
    },
}

/// Parses and shape-checks a raw task payload.
///
/// Field requirements: `correlation_id` (UUID), integer `user_id` and
/// `event_id`, and a `hints` object of scalar values. Existence checks
/// against the feature store are the worker's job, not this function's.
pub fn parse_task(payload: &str) -> Result<TaskEnvelope, TaskParseError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| TaskParseError::Malformed(format!("invalid JSON: {e}")))?;

    let correlation_id = value
        .get("correlation_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| TaskParseError::Malformed("missing or invalid correlation_id".into()))?;

    let invalid = |reason: String| TaskParseError::Invalid {
        correlation_id,
        reason,
    };

    let user_id = value
        .get("user_id")
        .ok_or_else(|| invalid("missing required field: user_id".into()))?
        .as_i64()
        .ok_or_else(|| invalid("user_id must be an integer".into()))?;

    let event_id = value
        .get("event_id")
        .ok_or_else(|| invalid("missing required field: event_id".into()))?
        .as_i64()
        .ok_or_else(|| invalid("event_id must be an integer".into()))?;

    let hints_value = value
        .get("hints")
        .ok_or_else(|| invalid("missing required field: hints".into()))?;
    if !hints_value.is_object() {
        return Err(invalid("hints must be an object".into()));
    }
    let hints: HintMap = serde_json::from_value(hints_value.clone())
        .map_err(|e| invalid(format!("hints must map names to scalars: {e}")))?;

    let created_at = value
        .get("created_at")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_else(Utc::now);

    let priority = value
        .get("priority")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    Ok(TaskEnvelope {
        correlation_id,
        user_id,
        event_id,
        hints,
        created_at,
        priority,
    })
}

/// Outcome status of a processed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Processed successfully; a prediction is attached.
    Completed,
    /// Rejected permanently by validation or feature extraction.
    Failed,
    /// An unexpected processing error; the task was dropped.
    Error,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

/// Ordered participation-likelihood categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionLabel {
    #[serde(rename = "very_likely_to_join")]
    VeryLikely,
    #[serde(rename = "likely_to_join")]
    Likely,
    #[serde(rename = "might_join")]
    Might,
    #[serde(rename = "unlikely_to_join")]
    Unlikely,
    #[serde(rename = "very_unlikely_to_join")]
    VeryUnlikely,
}

impl PredictionLabel {
    /// Maps a confidence score to its label. Thresholds are inclusive:
    /// exactly 0.8 is `VeryLikely`, exactly 0.2 is `Unlikely`.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            PredictionLabel::VeryLikely
        } else if confidence >= 0.6 {
            PredictionLabel::Likely
        } else if confidence >= 0.4 {
            PredictionLabel::Might
        } else if confidence >= 0.2 {
            PredictionLabel::Unlikely
        } else {
            PredictionLabel::VeryUnlikely
        }
    }

    /// Canned recommendation text for this label.
    pub fn recommendation(&self) -> &'static str {
        match self {
            PredictionLabel::VeryLikely => "Great fit. Strongly recommend joining.",
            PredictionLabel::Likely => "Good odds. Worth considering.",
            PredictionLabel::Might => "Could go either way. Weigh your interest and budget.",
            PredictionLabel::Unlikely => "Probably not a match. Consider other events.",
            PredictionLabel::VeryUnlikely => "Joining is not recommended.",
        }
    }
}

impl fmt::Display for PredictionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PredictionLabel::VeryLikely => "very_likely_to_join",
            PredictionLabel::Likely => "likely_to_join",
            PredictionLabel::Might => "might_join",
            PredictionLabel::Unlikely => "unlikely_to_join",
            PredictionLabel::VeryUnlikely => "very_unlikely_to_join",
        };
        write!(f, "{s}")
    }
}

/// A scored participation prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Likelihood category.
    pub label: PredictionLabel,
    /// Confidence in [0, 1], rounded to 3 decimal places.
    pub confidence: f64,
    /// Human-readable recommendation for the label.
    pub recommendation: String,
    /// The inputs that drove the score, rounded to 2 decimal places.
    pub signals: BTreeMap<String, f64>,
    /// Version of the model that produced this prediction.
    pub model_version: String,
}

/// The outcome of one task, published to the results queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Correlation id of the task this result answers.
    pub correlation_id: Uuid,
    /// Outcome status.
    pub status: TaskStatus,
    /// Subject user, echoed on success.
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Subject event, echoed on success.
    #[serde(default)]
    pub event_id: Option<i64>,
    /// The prediction, present when `status` is `Completed`.
    #[serde(default)]
    pub prediction: Option<Prediction>,
    /// Failure or error message, present otherwise.
    #[serde(default)]
    pub error: Option<String>,
    /// Names of the features fed to the model.
    #[serde(default)]
    pub features_used: Vec<String>,
    /// Worker that produced this result.
    pub worker_id: String,
    /// Wall-clock processing time in milliseconds.
    pub duration_ms: u64,
    /// When processing finished.
    pub completed_at: DateTime<Utc>,
}

impl ResultEnvelope {
    /// A successful result carrying a prediction.
    pub fn completed(
        task: &TaskEnvelope,
        prediction: Prediction,
        features_used: Vec<String>,
        worker_id: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            correlation_id: task.correlation_id,
            status: TaskStatus::Completed,
            user_id: Some(task.user_id),
            event_id: Some(task.event_id),
            prediction: Some(prediction),
            error: None,
            features_used,
            worker_id: worker_id.into(),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// A permanent validation or extraction failure.
    pub fn failed(
        correlation_id: Uuid,
        reason: impl Into<String>,
        worker_id: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            correlation_id,
            status: TaskStatus::Failed,
            user_id: None,
            event_id: None,
            prediction: None,
            error: Some(reason.into()),
            features_used: Vec::new(),
            worker_id: worker_id.into(),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// An unexpected processing error.
    pub fn errored(
        correlation_id: Uuid,
        message: impl Into<String>,
        worker_id: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            correlation_id,
            status: TaskStatus::Error,
            user_id: None,
            event_id: None,
            prediction: None,
            error: Some(message.into()),
            features_used: Vec::new(),
            worker_id: worker_id.into(),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// Whether the task completed with a prediction.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
