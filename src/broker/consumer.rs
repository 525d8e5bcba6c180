//! Task queue consumers.
//!
//! Each worker owns an independent channel with prefetch = 1 and manual
//! acknowledgement. Every delivery resolves to exactly one disposition:
//! ack, nack-requeue (bounded retry) or nack-no-requeue (drop to the DLX).

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use thiserror::Error;

use crate::metrics::DELIVERIES_TOTAL;
use crate::store::{TaskRetryState, TaskStore};

use super::topology::queue_for_task_type;
use super::{BrokerClient, BrokerError, TaskMessage, TaskType};

/// Failure reported by a task handler, carrying the retry accounting the
/// consumer needs to apply the redelivery policy.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub retryable: bool,
    pub retry_count: i16,
    pub max_retry: i16,
    pub message: String,
}

impl HandlerError {
    /// A transient failure worth redelivering, bounded by the persisted
    /// retry state.
    pub fn retryable(state: TaskRetryState, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            retry_count: state.retry_count,
            max_retry: state.max_retry,
            message: message.into(),
        }
    }

    /// A terminal failure: never redelivered.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            retry_count: 0,
            max_retry: 0,
            message: message.into(),
        }
    }
}

/// Strategy invoked once per delivery.
///
/// Implementations must re-check the persisted task status first and
/// no-op-succeed when it is already terminal, so redeliveries are
/// idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, message: &TaskMessage) -> Result<(), HandlerError>;
}

/// What the consumer does with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    NackRequeue,
    NackDrop,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::NackRequeue => "nack_requeue",
            Disposition::NackDrop => "nack_drop",
        }
    }
}

/// Map a handler outcome to a delivery disposition.
///
/// Retryable failures are requeued only while retry_count < max_retry;
/// everything else is dropped to the DLX by the broker.
pub fn disposition_for(result: &Result<(), HandlerError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(e) if e.retryable && e.retry_count < e.max_retry => Disposition::NackRequeue,
        Err(_) => Disposition::NackDrop,
    }
}

/// Spawn `count` independent consumer loops for one task type.
pub fn spawn_workers(
    count: usize,
    task_type: TaskType,
    broker: Arc<BrokerClient>,
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn TaskHandler>,
) {
    let queue = queue_for_task_type(task_type);

    for worker in 0..count {
        let broker = broker.clone();
        let store = store.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            tracing::info!(queue = queue, worker = worker, "Worker starting");
            match consume_loop(&broker, queue, store, handler).await {
                Ok(()) => tracing::info!(queue = queue, worker = worker, "Worker stopped"),
                Err(e) => {
                    tracing::warn!(queue = queue, worker = worker, error = %e, "Worker stopped")
                }
            }
        });
    }
}

/// Consume one queue until its channel or connection closes.
async fn consume_loop(
    broker: &BrokerClient,
    queue: &'static str,
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn TaskHandler>,
) -> Result<(), BrokerError> {
    // own channel per worker: ack scope must not be shared
    let channel = broker.create_channel().await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let mut consumer = channel
        .basic_consume(
            queue,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        process_delivery(queue, delivery, &*store, &*handler).await;
    }

    Ok(())
}

async fn process_delivery(
    queue: &'static str,
    delivery: Delivery,
    store: &dyn TaskStore,
    handler: &dyn TaskHandler,
) {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();

    // Malformed bodies are poison: drop without retry.
    let message: TaskMessage = match serde_json::from_slice(&delivery.data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(
                queue = queue,
                message_id = %message_id,
                error = %e,
                "Undecodable task message, dropping"
            );
            finish(queue, delivery, &message_id, Disposition::NackDrop).await;
            return;
        }
    };

    let result = handler.handle(&message).await;
    let disposition = disposition_for(&result);

    finish(queue, delivery, &message.task_id, disposition).await;

    match (disposition, result) {
        (Disposition::NackRequeue, Err(e)) => {
            tracing::warn!(
                queue = queue,
                task_id = %message.task_id,
                retry_count = e.retry_count,
                max_retry = e.max_retry,
                error = %e,
                "Handler failed, requeued for retry"
            );
            // best-effort: a lost update just means one extra redelivery
            if let Err(store_err) = store
                .set_retry_count(&message.task_id, e.retry_count + 1)
                .await
            {
                tracing::warn!(
                    task_id = %message.task_id,
                    error = %store_err,
                    "Failed to persist retry count"
                );
            }
        }
        (Disposition::NackDrop, Err(e)) => {
            tracing::warn!(
                queue = queue,
                task_id = %message.task_id,
                error = %e,
                "Handler failed terminally, dropping to dead-letter exchange"
            );
            // Eager failure write keeps the user-visible status fresh; the
            // dead-letter worker remains the authoritative terminal writer.
            if let Err(store_err) = store.mark_failed(&message.task_id, &e.message).await {
                tracing::warn!(
                    task_id = %message.task_id,
                    error = %store_err,
                    "Failed to record terminal failure"
                );
            }
        }
        _ => {}
    }
}

async fn finish(queue: &'static str, delivery: Delivery, task_id: &str, disposition: Disposition) {
    DELIVERIES_TOTAL
        .with_label_values(&[queue, disposition.as_str()])
        .inc();

    let result = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::NackRequeue => {
            delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
        }
        Disposition::NackDrop => {
            delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
        }
    };

    if let Err(e) = result {
        tracing::warn!(
            queue = queue,
            task_id = %task_id,
            disposition = disposition.as_str(),
            error = %e,
            "Failed to settle delivery"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskStatus;

    fn state(retry_count: i16, max_retry: i16) -> TaskRetryState {
        TaskRetryState {
            retry_count,
            max_retry,
            status: TaskStatus::Queued,
        }
    }

    #[test]
    fn success_is_acked() {
        assert_eq!(disposition_for(&Ok(())), Disposition::Ack);
    }

    #[test]
    fn retryable_below_limit_is_requeued() {
        let result = Err(HandlerError::retryable(state(0, 2), "provider 503"));
        assert_eq!(disposition_for(&result), Disposition::NackRequeue);

        let result = Err(HandlerError::retryable(state(1, 2), "provider 503"));
        assert_eq!(disposition_for(&result), Disposition::NackRequeue);
    }

    #[test]
    fn retryable_at_limit_is_dropped() {
        let result = Err(HandlerError::retryable(state(2, 2), "provider 503"));
        assert_eq!(disposition_for(&result), Disposition::NackDrop);
    }

    #[test]
    fn fatal_is_dropped_regardless_of_count() {
        let result = Err(HandlerError::fatal("invalid payload"));
        assert_eq!(disposition_for(&result), Disposition::NackDrop);
    }
}
