//! Generation provider seam.
//!
//! Workers hand a task payload to a provider, get back a provider-side task
//! id, and poll its status with bounded attempts and a fixed delay. The
//! trait keeps handlers testable against fakes; the HTTP implementation
//! targets a ModelScope-style async generation API.

mod modelscope;

pub use modelscope::ModelScopeClient;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("generation failed: {0}")]
    TaskFailed(String),

    #[error("task succeeded but produced no outputs")]
    NoOutput,

    #[error("unknown provider task status: {0}")]
    UnknownStatus(String),

    #[error("task not completed within {attempts} polling attempts")]
    PollTimeout { attempts: u32 },
}

impl ProviderError {
    /// Terminal provider outcomes must not be redelivered; everything else
    /// is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::TaskFailed(_) | ProviderError::NoOutput | ProviderError::UnknownStatus(_)
        )
    }
}

/// Status of a provider-side generation task.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderTaskState {
    Pending,
    Processing,
    Succeeded(CompletedGeneration),
    Failed { message: String },
}

/// Outputs of a successful generation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletedGeneration {
    pub output_images: Vec<String>,
    pub time_taken_secs: f64,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submit a generation task; returns the provider's task id.
    async fn create_task(
        &self,
        provider_model_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError>;

    /// Poll the status of a previously created task.
    async fn poll_status(&self, provider_task_id: &str) -> Result<ProviderTaskState, ProviderError>;
}

/// Poll a provider task until it reaches a terminal state.
///
/// Fixed delay between attempts; gives up with [`ProviderError::PollTimeout`]
/// after `max_attempts` polls.
pub async fn wait_for_completion(
    provider: &dyn GenerationProvider,
    provider_task_id: &str,
    max_attempts: u32,
    poll_interval: Duration,
) -> Result<CompletedGeneration, ProviderError> {
    for attempt in 1..=max_attempts {
        match provider.poll_status(provider_task_id).await? {
            ProviderTaskState::Succeeded(result) => {
                if result.output_images.is_empty() {
                    return Err(ProviderError::NoOutput);
                }
                return Ok(result);
            }
            ProviderTaskState::Failed { message } => {
                return Err(ProviderError::TaskFailed(message));
            }
            ProviderTaskState::Pending | ProviderTaskState::Processing => {
                if attempt < max_attempts {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    Err(ProviderError::PollTimeout {
        attempts: max_attempts,
    })
}
