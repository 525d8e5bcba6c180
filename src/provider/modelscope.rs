//! ModelScope-style asynchronous generation API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;

use crate::config::ProviderConfig;

use super::{CompletedGeneration, GenerationProvider, ProviderError, ProviderTaskState};

const STATUS_SUCCEED: &str = "SUCCEED";
const STATUS_FAILED: &str = "FAILED";
const STATUS_PENDING: &str = "PENDING";
const STATUS_PROCESSING: &str = "PROCESSING";

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    task_status: String,
    #[serde(default)]
    output_images: Vec<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    time_taken: f64,
}

/// HTTP client for one provider endpoint.
///
/// Create is async on the provider side: the POST returns a task id which
/// is then polled on the tasks endpoint until it reaches SUCCEED/FAILED.
pub struct ModelScopeClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl ModelScopeClient {
    pub fn new(base_url: impl Into<String>, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            api_key: config.resolved_api_key(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        if self.base_url.ends_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl GenerationProvider for ModelScopeClient {
    async fn create_task(
        &self,
        provider_model_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let mut body = payload.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "model".to_string(),
                serde_json::Value::String(provider_model_id.to_string()),
            );
            // provider-side field name differs from ours
            map.remove("model_id");
        }

        let response = self
            .http
            .post(self.url("v1/images/generations"))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header("X-ModelScope-Async-Mode", "true")
            .json(&body)
            .send()
            .await?;

        let response = error_for_status(response).await?;
        let created: CreateTaskResponse = response.json().await?;

        tracing::debug!(provider_task_id = %created.task_id, "Provider task created");
        Ok(created.task_id)
    }

    async fn poll_status(&self, provider_task_id: &str) -> Result<ProviderTaskState, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("v1/tasks/{}", provider_task_id)))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header("X-ModelScope-Task-Type", "image_generation")
            .send()
            .await?;

        let response = error_for_status(response).await?;
        let status: TaskStatusResponse = response.json().await?;

        match status.task_status.as_str() {
            STATUS_SUCCEED => Ok(ProviderTaskState::Succeeded(CompletedGeneration {
                output_images: status.output_images,
                time_taken_secs: status.time_taken,
            })),
            STATUS_FAILED => Ok(ProviderTaskState::Failed {
                message: status.message,
            }),
            STATUS_PENDING => Ok(ProviderTaskState::Pending),
            STATUS_PROCESSING => Ok(ProviderTaskState::Processing),
            other => Err(ProviderError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_decodes_with_optional_fields() {
        let json = r#"{"task_id":"t","task_status":"PENDING","request_id":"r"}"#;
        let decoded: TaskStatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(decoded.task_status, "PENDING");
        assert!(decoded.output_images.is_empty());
    }

    #[test]
    fn url_join_handles_trailing_slash() {
        let config = ProviderConfig::default();
        let with_slash = ModelScopeClient::new("https://api.example/", &config).unwrap();
        let without = ModelScopeClient::new("https://api.example", &config).unwrap();
        assert_eq!(with_slash.url("v1/tasks/x"), "https://api.example/v1/tasks/x");
        assert_eq!(without.url("v1/tasks/x"), "https://api.example/v1/tasks/x");
    }
}
