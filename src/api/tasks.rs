//! Task enqueue endpoint.
//!
//! The task row itself is created upstream; this endpoint validates the
//! request, publishes it to the generation exchange and waits for the
//! broker's confirm before answering.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::broker::{TaskMessage, TaskType};
use crate::error::AppError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct EnqueueTaskRequest {
    pub task_id: String,
    pub user_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EnqueueTaskResponse {
    pub task_id: String,
    pub status: String,
}

/// POST /api/v1/tasks
#[tracing::instrument(name = "api.enqueue_task", skip(state, request), fields(task_id = %request.task_id))]
pub async fn enqueue_task(
    State(state): State<AppState>,
    Json(request): Json<EnqueueTaskRequest>,
) -> Result<(StatusCode, Json<EnqueueTaskResponse>), AppError> {
    if request.task_id.is_empty() {
        return Err(AppError::Validation("task_id must not be empty".to_string()));
    }
    if request.user_id.is_empty() {
        return Err(AppError::Validation("user_id must not be empty".to_string()));
    }

    let task_type: TaskType = request
        .task_type
        .parse()
        .map_err(AppError::Validation)?;

    let message = TaskMessage::new(request.task_id.clone(), request.user_id, request.payload);
    state.publisher.publish(task_type, &message).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueTaskResponse {
            task_id: request.task_id,
            status: "queued".to_string(),
        }),
    ))
}
