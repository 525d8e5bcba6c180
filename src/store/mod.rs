//! Task persistence seam for the pipeline.
//!
//! The pipeline never owns the task schema: it reads and updates a handful
//! of keyed fields through the [`TaskStore`] trait. The Postgres
//! implementation backs production; the in-memory implementation backs
//! tests and embedded use.

mod memory;
mod postgres;

pub use memory::{MemoryTaskStore, TaskRecord};
pub use postgres::PostgresTaskStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::TaskType;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("unknown status code: {0}")]
    UnknownStatus(i16),
}

/// Lifecycle status of a generation task.
///
/// Progression is monotonic: pending → queued → processing → one of the
/// terminal states. Terminal tasks are never reprocessed; handlers check
/// this before doing any work so redeliveries are idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Numeric code used by the task table.
    pub fn as_i16(&self) -> i16 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Queued => 1,
            TaskStatus::Processing => 2,
            TaskStatus::Completed => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Cancelled => 5,
        }
    }

    pub fn from_i16(code: i16) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Pending),
            1 => Some(TaskStatus::Queued),
            2 => Some(TaskStatus::Processing),
            3 => Some(TaskStatus::Completed),
            4 => Some(TaskStatus::Failed),
            5 => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Narrow view of the retry-relevant task fields.
///
/// The queue layer only needs these three columns; handing it the full row
/// would couple it to schema it has no business knowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRetryState {
    pub retry_count: i16,
    pub max_retry: i16,
    pub status: TaskStatus,
}

impl TaskRetryState {
    /// Whether another redelivery is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry
    }
}

/// Record written once per dead-lettered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub user_id: String,
    pub task_id: String,
    pub task_type: TaskType,
    pub dead_reason: String,
    pub original_status: TaskStatus,
}

/// Outputs persisted when a generation task completes.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub output_image_url: String,
    pub actual_seed: i64,
    pub generation_time_ms: i64,
}

/// Provider routing data for a model.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub base_url: String,
    pub provider_model_id: String,
}

/// Keyed field access to task state.
///
/// All writes are idempotent / last-write-wins so the consumer's eager
/// failure write and the dead-letter worker's authoritative write cannot
/// corrupt each other when they race.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Read the retry-relevant fields for a task.
    async fn retry_state(&self, task_id: &str) -> Result<TaskRetryState, StoreError>;

    /// Persist an updated retry count.
    async fn set_retry_count(&self, task_id: &str, retry_count: i16) -> Result<(), StoreError>;

    /// Move a task to processing and stamp started_at.
    async fn mark_processing(&self, task_id: &str) -> Result<(), StoreError>;

    /// Finalize a task as completed with its outputs.
    async fn mark_completed(&self, task_id: &str, output: &TaskOutput) -> Result<(), StoreError>;

    /// Finalize a task as failed with an error message and completed_at.
    async fn mark_failed(&self, task_id: &str, error_message: &str) -> Result<(), StoreError>;

    /// Task type of a stored task.
    async fn task_type(&self, task_id: &str) -> Result<TaskType, StoreError>;

    /// Resolve the provider endpoint for a model.
    async fn model_endpoint(&self, model_id: &str) -> Result<ModelEndpoint, StoreError>;

    /// Insert a dead-letter record. Callers check existence first.
    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StoreError>;

    /// Whether a dead-letter record already exists for this task.
    async fn dead_letter_exists(&self, task_id: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_i16(status.as_i16()), Some(status));
        }
        assert_eq!(TaskStatus::from_i16(9), None);
    }

    #[test]
    fn retry_state_gate() {
        let state = TaskRetryState {
            retry_count: 1,
            max_retry: 2,
            status: TaskStatus::Queued,
        };
        assert!(state.can_retry());

        let exhausted = TaskRetryState {
            retry_count: 2,
            max_retry: 2,
            status: TaskStatus::Queued,
        };
        assert!(!exhausted.can_retry());
    }
}
