//! In-memory task store backed by DashMap.
//!
//! Used by tests and embedded setups; state is lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::broker::TaskType;

use super::{
    DeadLetterRecord, ModelEndpoint, StoreError, TaskOutput, TaskRetryState, TaskStatus, TaskStore,
};

/// One task row, narrowed to the fields the pipeline touches.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub user_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub retry_count: i16,
    pub max_retry: i16,
    pub error_message: Option<String>,
    pub output: Option<TaskOutput>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn queued(user_id: impl Into<String>, task_type: TaskType, max_retry: i16) -> Self {
        Self {
            user_id: user_id.into(),
            task_type,
            status: TaskStatus::Queued,
            retry_count: 0,
            max_retry,
            error_message: None,
            output: None,
            started_at: None,
            completed_at: None,
        }
    }
}

pub struct MemoryTaskStore {
    tasks: DashMap<String, TaskRecord>,
    dead_letters: DashMap<String, DeadLetterRecord>,
    models: DashMap<String, ModelEndpoint>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            dead_letters: DashMap::new(),
            models: DashMap::new(),
        }
    }

    pub fn insert_task(&self, task_id: impl Into<String>, record: TaskRecord) {
        self.tasks.insert(task_id.into(), record);
    }

    pub fn insert_model(&self, model_id: impl Into<String>, endpoint: ModelEndpoint) {
        self.models.insert(model_id.into(), endpoint);
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|r| r.clone())
    }

    pub fn dead_letter(&self, task_id: &str) -> Option<DeadLetterRecord> {
        self.dead_letters.get(task_id).map(|r| r.clone())
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.len()
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn retry_state(&self, task_id: &str) -> Result<TaskRetryState, StoreError> {
        let record = self
            .tasks
            .get(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        Ok(TaskRetryState {
            retry_count: record.retry_count,
            max_retry: record.max_retry,
            status: record.status,
        })
    }

    async fn set_retry_count(&self, task_id: &str, retry_count: i16) -> Result<(), StoreError> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        record.retry_count = retry_count;
        Ok(())
    }

    async fn mark_processing(&self, task_id: &str) -> Result<(), StoreError> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        record.status = TaskStatus::Processing;
        record.started_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_completed(&self, task_id: &str, output: &TaskOutput) -> Result<(), StoreError> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        record.status = TaskStatus::Completed;
        record.output = Some(output.clone());
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, error_message: &str) -> Result<(), StoreError> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        record.status = TaskStatus::Failed;
        record.error_message = Some(error_message.to_string());
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn task_type(&self, task_id: &str) -> Result<TaskType, StoreError> {
        let record = self
            .tasks
            .get(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        Ok(record.task_type)
    }

    async fn model_endpoint(&self, model_id: &str) -> Result<ModelEndpoint, StoreError> {
        self.models
            .get(model_id)
            .map(|m| m.clone())
            .ok_or_else(|| StoreError::ModelNotFound(model_id.to_string()))
    }

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        self.dead_letters
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn dead_letter_exists(&self, task_id: &str) -> Result<bool, StoreError> {
        Ok(self.dead_letters.contains_key(task_id))
    }
}
