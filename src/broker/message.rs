use serde::{Deserialize, Serialize};
use std::fmt;

/// Task categories carried by the pipeline. Each type has its own queue and
/// routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Text2Img,
    Img2Img,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Text2Img => "text2img",
            TaskType::Img2Img => "img2img",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text2img" => Ok(TaskType::Text2Img),
            "img2img" => Ok(TaskType::Img2Img),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}

/// Message published for every generation task.
///
/// Serialized as the broker message body; the AMQP message-id property is
/// set to `task_id` so log lines and redeliveries can be correlated without
/// decoding the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub user_uuid: String,
    pub payload: serde_json::Value,
}

impl TaskMessage {
    pub fn new(task_id: impl Into<String>, user_uuid: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            user_uuid: user_uuid.into(),
            payload,
        }
    }
}

/// Payload for text-to-image tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Text2ImgPayload {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub model_id: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub seed: i64,
}

/// Payload for image-to-image tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Img2ImgPayload {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub model_id: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub seed: i64,
    pub input_image_url: String,
    pub strength: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_message_round_trips_as_wire_json() {
        let msg = TaskMessage::new(
            "task-1",
            "user-1",
            json!({"prompt": "a lighthouse", "model_id": "m-1"}),
        );

        let body = serde_json::to_string(&msg).unwrap();
        assert!(body.contains("\"task_id\":\"task-1\""));
        assert!(body.contains("\"user_uuid\":\"user-1\""));

        let decoded: TaskMessage = serde_json::from_str(&body).unwrap();
        assert_eq!(decoded.task_id, "task-1");
        assert_eq!(decoded.payload["prompt"], "a lighthouse");
    }

    #[test]
    fn malformed_body_fails_to_decode() {
        let err = serde_json::from_str::<TaskMessage>("{not json").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn task_type_parses_from_string() {
        assert_eq!("text2img".parse::<TaskType>().unwrap(), TaskType::Text2Img);
        assert_eq!("img2img".parse::<TaskType>().unwrap(), TaskType::Img2Img);
        assert!("video".parse::<TaskType>().is_err());
    }

    #[test]
    fn text2img_payload_decodes_from_task_message() {
        let msg = TaskMessage::new(
            "task-2",
            "user-2",
            json!({
                "prompt": "a harbor at dusk",
                "model_id": "m-2",
                "width": 1024,
                "height": 768,
                "num_inference_steps": 30,
                "guidance_scale": 7.5,
                "seed": 42
            }),
        );

        let payload: Text2ImgPayload = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(payload.width, 1024);
        assert_eq!(payload.negative_prompt, "");
        assert_eq!(payload.seed, 42);
    }
}
