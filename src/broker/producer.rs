//! Confirmed, persistent task publishing.

use std::sync::Arc;

use chrono::Utc;
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;

use crate::metrics::{MESSAGES_PUBLISHED_TOTAL, PUBLISH_FAILURES_TOTAL};

use super::topology::{routing_key_for_task_type, EXCHANGE_GENERATION};
use super::{BrokerClient, BrokerError, TaskMessage, TaskType};

/// Publishes task messages on the shared confirmed channel.
pub struct Publisher {
    broker: Arc<BrokerClient>,
}

impl Publisher {
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        Self { broker }
    }

    /// Publish a task message and wait for the broker's confirm.
    ///
    /// Once this returns Ok the message is durably queued; delivery to
    /// consumers is at-least-once. On any error the caller is responsible
    /// for rolling back the task record it created.
    pub async fn publish(
        &self,
        task_type: TaskType,
        message: &TaskMessage,
    ) -> Result<(), BrokerError> {
        let result = self.publish_inner(task_type, message).await;
        if result.is_err() {
            PUBLISH_FAILURES_TOTAL.inc();
        }
        result
    }

    async fn publish_inner(
        &self,
        task_type: TaskType,
        message: &TaskMessage,
    ) -> Result<(), BrokerError> {
        let channel = self.broker.channel().await?;
        let routing_key = routing_key_for_task_type(task_type);
        let body = serde_json::to_vec(message)?;

        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_message_id(message.task_id.clone().into())
            .with_content_type("application/json".into())
            .with_timestamp(Utc::now().timestamp() as u64);

        let confirm = channel
            .basic_publish(
                EXCHANGE_GENERATION,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        if !confirm.is_ack() {
            return Err(BrokerError::NotConfirmed);
        }

        MESSAGES_PUBLISHED_TOTAL
            .with_label_values(&[routing_key])
            .inc();

        tracing::info!(
            task_id = %message.task_id,
            routing_key = routing_key,
            "Task message published"
        );

        Ok(())
    }
}
