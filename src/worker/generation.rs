use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{
    HandlerError, Img2ImgPayload, TaskHandler, TaskMessage, TaskType, Text2ImgPayload,
};
use crate::config::ProviderConfig;
use crate::hub::{HubHandle, PushKind, TaskCompletedData, TaskProgressData};
use crate::provider::{wait_for_completion, GenerationProvider, ModelScopeClient, ProviderError};
use crate::store::{TaskOutput, TaskStore};

/// Builds a provider client for the base URL a model is served from.
///
/// Each model row carries its own endpoint, so a single handler may talk
/// to several provider deployments.
pub trait ProviderFactory: Send + Sync {
    fn provider_for(&self, base_url: &str) -> Result<Arc<dyn GenerationProvider>, ProviderError>;
}

pub struct ModelScopeFactory {
    config: ProviderConfig,
}

impl ModelScopeFactory {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl ProviderFactory for ModelScopeFactory {
    fn provider_for(&self, base_url: &str) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
        Ok(Arc::new(ModelScopeClient::new(base_url, &self.config)?))
    }
}

/// Handler for one generation queue.
///
/// Redeliveries of terminal tasks are acked without work, so a message the
/// broker delivers twice cannot complete a task twice.
pub struct GenerationTaskHandler {
    task_type: TaskType,
    store: Arc<dyn TaskStore>,
    hub: HubHandle,
    factory: Arc<dyn ProviderFactory>,
    poll_max_attempts: u32,
    poll_interval: Duration,
}

impl GenerationTaskHandler {
    pub fn new(
        task_type: TaskType,
        store: Arc<dyn TaskStore>,
        hub: HubHandle,
        factory: Arc<dyn ProviderFactory>,
        config: &ProviderConfig,
    ) -> Self {
        Self {
            task_type,
            store,
            hub,
            factory,
            poll_max_attempts: config.poll_max_attempts,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// Pull the routing fields out of the payload, validating its shape for
    /// this queue's task type.
    fn decode_payload(&self, message: &TaskMessage) -> Result<(String, i64), HandlerError> {
        match self.task_type {
            TaskType::Text2Img => {
                let payload: Text2ImgPayload = serde_json::from_value(message.payload.clone())
                    .map_err(|e| HandlerError::fatal(format!("invalid text2img payload: {}", e)))?;
                Ok((payload.model_id, payload.seed))
            }
            TaskType::Img2Img => {
                let payload: Img2ImgPayload = serde_json::from_value(message.payload.clone())
                    .map_err(|e| HandlerError::fatal(format!("invalid img2img payload: {}", e)))?;
                Ok((payload.model_id, payload.seed))
            }
        }
    }
}

#[async_trait]
impl TaskHandler for GenerationTaskHandler {
    async fn handle(&self, message: &TaskMessage) -> Result<(), HandlerError> {
        let task_id = message.task_id.as_str();

        // A task we know nothing about cannot be retried into existence.
        let state = self
            .store
            .retry_state(task_id)
            .await
            .map_err(|e| HandlerError::fatal(format!("failed to load task: {}", e)))?;

        if state.status.is_terminal() {
            tracing::info!(
                task_id = %task_id,
                status = state.status.as_str(),
                "Task already terminal, acking redelivery"
            );
            return Ok(());
        }

        let (model_id, seed) = self.decode_payload(message)?;

        self.store
            .mark_processing(task_id)
            .await
            .map_err(|e| HandlerError::retryable(state, format!("failed to mark processing: {}", e)))?;

        self.hub
            .send_to_user(
                &message.user_uuid,
                PushKind::TaskProgress,
                TaskProgressData {
                    task_id: task_id.to_string(),
                    status: "processing".to_string(),
                },
            )
            .await;

        let endpoint = self.store.model_endpoint(&model_id).await.map_err(|e| {
            use crate::store::StoreError;
            match e {
                StoreError::ModelNotFound(_) => {
                    HandlerError::fatal(format!("unknown model {}: {}", model_id, e))
                }
                other => HandlerError::retryable(state, format!("model lookup failed: {}", other)),
            }
        })?;

        let provider = self
            .factory
            .provider_for(&endpoint.base_url)
            .map_err(|e| provider_error(e, state))?;

        tracing::info!(
            task_id = %task_id,
            task_type = %self.task_type,
            model_id = %model_id,
            "Submitting generation task"
        );

        let provider_task_id = provider
            .create_task(&endpoint.provider_model_id, &message.payload)
            .await
            .map_err(|e| provider_error(e, state))?;

        let result = wait_for_completion(
            provider.as_ref(),
            &provider_task_id,
            self.poll_max_attempts,
            self.poll_interval,
        )
        .await
        .map_err(|e| provider_error(e, state))?;

        let output = TaskOutput {
            output_image_url: result.output_images[0].clone(),
            actual_seed: seed,
            generation_time_ms: (result.time_taken_secs * 1000.0) as i64,
        };

        self.store
            .mark_completed(task_id, &output)
            .await
            .map_err(|e| HandlerError::retryable(state, format!("failed to mark completed: {}", e)))?;

        tracing::info!(
            task_id = %task_id,
            generation_time_ms = output.generation_time_ms,
            "Generation task completed"
        );

        self.hub
            .send_to_user(
                &message.user_uuid,
                PushKind::TaskCompleted,
                TaskCompletedData {
                    task_id: task_id.to_string(),
                    status: "completed".to_string(),
                    output_image_url: output.output_image_url,
                    generation_time_ms: output.generation_time_ms,
                },
            )
            .await;

        Ok(())
    }
}

fn provider_error(e: ProviderError, state: crate::store::TaskRetryState) -> HandlerError {
    if e.is_retryable() {
        HandlerError::retryable(state, e.to_string())
    } else {
        HandlerError::fatal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::broker::disposition_for;
    use crate::broker::Disposition;
    use crate::provider::{CompletedGeneration, ProviderTaskState};
    use crate::store::{MemoryTaskStore, ModelEndpoint, TaskRecord, TaskStatus};

    struct FakeProvider {
        polls: AtomicU32,
        outcome: fn(u32) -> Result<ProviderTaskState, ProviderError>,
    }

    #[async_trait]
    impl GenerationProvider for FakeProvider {
        async fn create_task(
            &self,
            _provider_model_id: &str,
            _payload: &serde_json::Value,
        ) -> Result<String, ProviderError> {
            Ok("prov-1".to_string())
        }

        async fn poll_status(
            &self,
            _provider_task_id: &str,
        ) -> Result<ProviderTaskState, ProviderError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.outcome)(n)
        }
    }

    struct FakeFactory {
        outcome: fn(u32) -> Result<ProviderTaskState, ProviderError>,
    }

    impl ProviderFactory for FakeFactory {
        fn provider_for(
            &self,
            _base_url: &str,
        ) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
            Ok(Arc::new(FakeProvider {
                polls: AtomicU32::new(0),
                outcome: self.outcome,
            }))
        }
    }

    fn text2img_message(task_id: &str) -> TaskMessage {
        TaskMessage::new(
            task_id,
            "user-1",
            serde_json::json!({
                "prompt": "a lighthouse at dusk",
                "model_id": "model-1",
                "width": 512,
                "height": 512,
                "num_inference_steps": 30,
                "guidance_scale": 7.5,
                "seed": 42
            }),
        )
    }

    fn handler_with(
        store: Arc<MemoryTaskStore>,
        outcome: fn(u32) -> Result<ProviderTaskState, ProviderError>,
    ) -> GenerationTaskHandler {
        let config = ProviderConfig {
            poll_max_attempts: 3,
            poll_interval_secs: 0,
            ..ProviderConfig::default()
        };
        GenerationTaskHandler::new(
            TaskType::Text2Img,
            store,
            crate::hub::start(),
            Arc::new(FakeFactory { outcome }),
            &config,
        )
    }

    fn seed_store() -> Arc<MemoryTaskStore> {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_task("t-1", TaskRecord::queued("user-1", TaskType::Text2Img, 2));
        store.insert_model(
            "model-1",
            ModelEndpoint {
                base_url: "https://provider.example".to_string(),
                provider_model_id: "vendor/model-1".to_string(),
            },
        );
        store
    }

    #[tokio::test]
    async fn successful_generation_completes_the_task() {
        let store = seed_store();
        let handler = handler_with(store.clone(), |_| {
            Ok(ProviderTaskState::Succeeded(CompletedGeneration {
                output_images: vec!["https://img.example/out.png".to_string()],
                time_taken_secs: 2.5,
            }))
        });

        let result = handler.handle(&text2img_message("t-1")).await;
        assert_eq!(disposition_for(&result), Disposition::Ack);

        let record = store.task("t-1").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        let output = record.output.unwrap();
        assert_eq!(output.output_image_url, "https://img.example/out.png");
        assert_eq!(output.actual_seed, 42);
        assert_eq!(output.generation_time_ms, 2500);
    }

    #[tokio::test]
    async fn provider_failure_is_fatal() {
        let store = seed_store();
        let handler = handler_with(store.clone(), |_| {
            Ok(ProviderTaskState::Failed {
                message: "nsfw content detected".to_string(),
            })
        });

        let result = handler.handle(&text2img_message("t-1")).await;
        assert_eq!(disposition_for(&result), Disposition::NackDrop);
        assert!(!result.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn poll_timeout_requeues_until_retries_exhausted() {
        let store = seed_store();
        let handler = handler_with(store.clone(), |_| Ok(ProviderTaskState::Processing));

        // retry_count 0 of max 2: redeliver
        let result = handler.handle(&text2img_message("t-1")).await;
        assert_eq!(disposition_for(&result), Disposition::NackRequeue);

        // exhausted: drop to the dead-letter exchange
        store.set_retry_count("t-1", 2).await.unwrap();
        let result = handler.handle(&text2img_message("t-1")).await;
        assert_eq!(disposition_for(&result), Disposition::NackDrop);
    }

    #[tokio::test]
    async fn terminal_task_redelivery_is_a_no_op() {
        let store = seed_store();
        store
            .mark_completed("t-1", &TaskOutput::default())
            .await
            .unwrap();
        let before = store.task("t-1").unwrap();

        let handler = handler_with(store.clone(), |_| {
            Ok(ProviderTaskState::Failed {
                message: "should never be polled".to_string(),
            })
        });

        let result = handler.handle(&text2img_message("t-1")).await;
        assert_eq!(disposition_for(&result), Disposition::Ack);
        assert_eq!(store.task("t-1").unwrap().status, before.status);
    }

    #[tokio::test]
    async fn unknown_task_is_dropped() {
        let store = Arc::new(MemoryTaskStore::new());
        let handler = handler_with(store, |_| Ok(ProviderTaskState::Processing));

        let result = handler.handle(&text2img_message("missing")).await;
        assert_eq!(disposition_for(&result), Disposition::NackDrop);
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal() {
        let store = seed_store();
        let handler = handler_with(store, |_| Ok(ProviderTaskState::Processing));

        let message = TaskMessage::new("t-1", "user-1", serde_json::json!({"prompt": 7}));
        let result = handler.handle(&message).await;
        assert_eq!(disposition_for(&result), Disposition::NackDrop);
        assert!(!result.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn unknown_model_is_fatal() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_task("t-1", TaskRecord::queued("user-1", TaskType::Text2Img, 2));
        let handler = handler_with(store, |_| Ok(ProviderTaskState::Processing));

        let result = handler.handle(&text2img_message("t-1")).await;
        assert_eq!(disposition_for(&result), Disposition::NackDrop);
        assert!(!result.unwrap_err().retryable);
    }
}
