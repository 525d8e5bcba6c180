//! PostgreSQL task store.
//!
//! Keyed field reads and updates against the task tables. The schema is
//! owned by the API layer's migrations; this module only touches the
//! columns the pipeline needs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::broker::TaskType;
use crate::config::DatabaseConfig;

use super::{
    DeadLetterRecord, ModelEndpoint, StoreError, TaskOutput, TaskRetryState, TaskStatus, TaskStore,
};

pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a store with a new connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds as u64))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds as u64))
            .connect(&config.url)
            .await?;

        tracing::info!(pool_size = config.pool_size, "PostgreSQL connection pool created");

        Ok(Self { pool })
    }

    /// Wrap an existing pool (shared with the API layer).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn retry_state(&self, task_id: &str) -> Result<TaskRetryState, StoreError> {
        let row: Option<(i16, i16, i16)> = sqlx::query_as(
            "SELECT retry_count, max_retry, status FROM generation_tasks WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let (retry_count, max_retry, status_code) =
            row.ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let status = TaskStatus::from_i16(status_code)
            .ok_or(StoreError::UnknownStatus(status_code))?;

        Ok(TaskRetryState {
            retry_count,
            max_retry,
            status,
        })
    }

    async fn set_retry_count(&self, task_id: &str, retry_count: i16) -> Result<(), StoreError> {
        sqlx::query("UPDATE generation_tasks SET retry_count = $1 WHERE task_id = $2")
            .bind(retry_count)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_processing(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE generation_tasks SET status = $1, started_at = $2 WHERE task_id = $3",
        )
        .bind(TaskStatus::Processing.as_i16())
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, task_id: &str, output: &TaskOutput) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE generation_tasks \
             SET status = $1, output_image_url = $2, actual_seed = $3, \
                 generation_time_ms = $4, completed_at = $5 \
             WHERE task_id = $6",
        )
        .bind(TaskStatus::Completed.as_i16())
        .bind(&output.output_image_url)
        .bind(output.actual_seed)
        .bind(output.generation_time_ms)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, error_message: &str) -> Result<(), StoreError> {
        // Last-write-wins so an eager consumer write and the dead-letter
        // worker's authoritative write can race safely.
        sqlx::query(
            "UPDATE generation_tasks \
             SET status = $1, error_message = $2, completed_at = $3 \
             WHERE task_id = $4",
        )
        .bind(TaskStatus::Failed.as_i16())
        .bind(error_message)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_type(&self, task_id: &str) -> Result<TaskType, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT task_type FROM generation_tasks WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;

        let (task_type,) = row.ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        task_type
            .parse()
            .map_err(|_| StoreError::TaskNotFound(task_id.to_string()))
    }

    async fn model_endpoint(&self, model_id: &str) -> Result<ModelEndpoint, StoreError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT base_url, third_party_model_id \
             FROM image_generation_models WHERE model_id = $1",
        )
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;

        let (base_url, provider_model_id) =
            row.ok_or_else(|| StoreError::ModelNotFound(model_id.to_string()))?;
        Ok(ModelEndpoint {
            base_url,
            provider_model_id,
        })
    }

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dead_letter_tasks \
             (user_id, task_id, task_type, dead_reason, original_status) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(&record.user_id)
        .bind(&record.task_id)
        .bind(record.task_type.as_str())
        .bind(&record.dead_reason)
        .bind(record.original_status.as_i16())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter_exists(&self, task_id: &str) -> Result<bool, StoreError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_tasks WHERE task_id = $1")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }
}
