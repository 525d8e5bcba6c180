use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Push event types sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Connected,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

/// Envelope pushed over the wire as `{type, data, timestamp}`.
///
/// The target user id routes the envelope inside the hub and is never
/// serialized.
#[derive(Debug, Clone, Serialize)]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: PushKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedData {
    pub success_msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressData {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedData {
    pub task_id: String,
    pub status: String,
    pub output_image_url: String,
    pub generation_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailedData {
    pub task_id: String,
    pub status: String,
    pub error_message: String,
}
