//! Dead-letter queue worker.
//!
//! Classifies why the broker dead-lettered a message, records it exactly
//! once per task, finalizes the task state and notifies the owning user.
//! Dead-letter processing itself is never retried; a failure here is
//! nacked without requeue to avoid loops.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use serde::Serialize;

use crate::hub::{HubHandle, PushKind, TaskFailedData};
use crate::metrics::DEAD_LETTERS_TOTAL;
use crate::store::{DeadLetterRecord, StoreError, TaskStatus, TaskStore};

use super::topology::QUEUE_DEAD_LETTER;
use super::{BrokerClient, BrokerError, TaskMessage};

/// First entry of the broker's `x-death` header, decoded against the known
/// schema. Every field is optional; decode failure of any one of them just
/// leaves it empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct XDeath {
    pub reason: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub count: Option<i64>,
}

impl XDeath {
    /// Extract the first x-death entry from delivery headers.
    pub fn from_headers(headers: Option<&FieldTable>) -> Option<Self> {
        let headers = headers?;
        let key: ShortString = "x-death".into();
        let entries = match headers.inner().get(&key) {
            Some(AMQPValue::FieldArray(array)) => array.as_slice(),
            _ => return None,
        };
        let first = match entries.first() {
            Some(AMQPValue::FieldTable(table)) => table,
            _ => return None,
        };

        Some(Self {
            reason: string_field(first, "reason"),
            queue: string_field(first, "queue"),
            exchange: string_field(first, "exchange"),
            count: int_field(first, "count"),
        })
    }
}

fn string_field(table: &FieldTable, key: &str) -> Option<String> {
    let key: ShortString = key.into();
    match table.inner().get(&key) {
        Some(AMQPValue::LongString(s)) => {
            Some(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        Some(AMQPValue::ShortString(s)) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn int_field(table: &FieldTable, key: &str) -> Option<i64> {
    let key: ShortString = key.into();
    match table.inner().get(&key) {
        Some(AMQPValue::LongLongInt(v)) => Some(*v),
        Some(AMQPValue::LongInt(v)) => Some(*v as i64),
        _ => None,
    }
}

/// Classified cause of a dead-lettering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadReason {
    Rejected,
    Expired,
    MaxLen,
    Unknown(String),
}

impl DeadReason {
    pub fn from_raw(reason: &str) -> Self {
        match reason {
            "rejected" => DeadReason::Rejected,
            "expired" => DeadReason::Expired,
            "maxlen" => DeadReason::MaxLen,
            other => DeadReason::Unknown(other.to_string()),
        }
    }

    /// Human-readable cause stored on the dead-letter record.
    pub fn describe(&self) -> String {
        match self {
            DeadReason::Rejected => "retry attempts exhausted or rejected by consumer".to_string(),
            DeadReason::Expired => "message expired in queue before being processed".to_string(),
            DeadReason::MaxLen => "queue length limit exceeded".to_string(),
            DeadReason::Unknown(raw) => format!("unknown dead-letter reason: {}", raw),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DeadReason::Rejected => "rejected",
            DeadReason::Expired => "expired",
            DeadReason::MaxLen => "maxlen",
            DeadReason::Unknown(_) => "unknown",
        }
    }
}

/// Cause string when the broker attached no death metadata at all.
fn status_fallback(status: TaskStatus) -> String {
    format!("no death metadata; task was last seen {}", status.as_str())
}

/// Handles one dead-lettered message end to end.
///
/// Separated from the consumer loop so the idempotency and classification
/// logic is exercisable without a live broker.
pub struct DeadLetterProcessor {
    store: Arc<dyn TaskStore>,
    hub: HubHandle,
}

impl DeadLetterProcessor {
    pub fn new(store: Arc<dyn TaskStore>, hub: HubHandle) -> Self {
        Self { store, hub }
    }

    pub async fn process(
        &self,
        message: &TaskMessage,
        xdeath: Option<XDeath>,
    ) -> Result<(), StoreError> {
        // Redeliveries of an already-recorded dead letter are skipped.
        if self.store.dead_letter_exists(&message.task_id).await? {
            tracing::debug!(
                task_id = %message.task_id,
                "Dead letter already recorded, skipping"
            );
            return Ok(());
        }

        let task_type = self.store.task_type(&message.task_id).await?;
        let original_status = self.store.retry_state(&message.task_id).await?.status;

        let reason = xdeath
            .as_ref()
            .and_then(|x| x.reason.as_deref())
            .map(DeadReason::from_raw);
        let dead_reason = match &reason {
            Some(r) => r.describe(),
            None => status_fallback(original_status),
        };

        DEAD_LETTERS_TOTAL
            .with_label_values(&[reason.as_ref().map(DeadReason::label).unwrap_or("none")])
            .inc();

        self.store
            .insert_dead_letter(&DeadLetterRecord {
                user_id: message.user_uuid.clone(),
                task_id: message.task_id.clone(),
                task_type,
                dead_reason: dead_reason.clone(),
                original_status,
            })
            .await?;

        // The consumer may have written status=failed eagerly already.
        if original_status != TaskStatus::Failed {
            let error_message = xdeath
                .as_ref()
                .and_then(|x| serde_json::to_string(x).ok())
                .unwrap_or_else(|| dead_reason.clone());
            self.store
                .mark_failed(&message.task_id, &error_message)
                .await?;
        }

        self.hub
            .send_to_user(
                &message.user_uuid,
                PushKind::TaskFailed,
                TaskFailedData {
                    task_id: message.task_id.clone(),
                    status: "failed".to_string(),
                    error_message: dead_reason.clone(),
                },
            )
            .await;

        tracing::info!(
            task_id = %message.task_id,
            task_type = %task_type,
            dead_reason = %dead_reason,
            "Dead letter recorded"
        );

        Ok(())
    }
}

/// Spawn `count` dead-letter consumer loops.
pub fn spawn_dead_letter_workers(
    count: usize,
    broker: Arc<BrokerClient>,
    processor: Arc<DeadLetterProcessor>,
) {
    for worker in 0..count {
        let broker = broker.clone();
        let processor = processor.clone();

        tokio::spawn(async move {
            tracing::info!(worker = worker, "Dead-letter worker starting");
            match consume_dead_letters(&broker, processor).await {
                Ok(()) => tracing::info!(worker = worker, "Dead-letter worker stopped"),
                Err(e) => {
                    tracing::warn!(worker = worker, error = %e, "Dead-letter worker stopped")
                }
            }
        });
    }
}

async fn consume_dead_letters(
    broker: &BrokerClient,
    processor: Arc<DeadLetterProcessor>,
) -> Result<(), BrokerError> {
    let channel = broker.create_channel().await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let mut consumer = channel
        .basic_consume(
            QUEUE_DEAD_LETTER,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        process_dead_delivery(delivery, &processor).await;
    }

    Ok(())
}

async fn process_dead_delivery(delivery: Delivery, processor: &DeadLetterProcessor) {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();

    let message: TaskMessage = match serde_json::from_slice(&delivery.data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(
                message_id = %message_id,
                error = %e,
                "Undecodable dead-letter message, dropping"
            );
            settle(delivery, &message_id, false).await;
            return;
        }
    };

    let xdeath = XDeath::from_headers(delivery.properties.headers().as_ref());

    match processor.process(&message, xdeath).await {
        Ok(()) => settle(delivery, &message.task_id, true).await,
        Err(e) => {
            tracing::error!(
                task_id = %message.task_id,
                error = %e,
                "Dead-letter processing failed, dropping"
            );
            settle(delivery, &message.task_id, false).await;
        }
    }
}

async fn settle(delivery: Delivery, task_id: &str, ack: bool) {
    let result = if ack {
        delivery.ack(BasicAckOptions::default()).await
    } else {
        delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
    };

    if let Err(e) = result {
        tracing::warn!(task_id = %task_id, error = %e, "Failed to settle dead-letter delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;

    fn xdeath_headers(reason: &str) -> FieldTable {
        let mut entry = FieldTable::default();
        entry.insert("reason".into(), AMQPValue::LongString(reason.into()));
        entry.insert("queue".into(), AMQPValue::LongString("queue.text2img".into()));
        entry.insert("count".into(), AMQPValue::LongLongInt(1));

        let mut headers = FieldTable::default();
        headers.insert(
            "x-death".into(),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(entry)])),
        );
        headers
    }

    #[test]
    fn decodes_first_x_death_entry() {
        let headers = xdeath_headers("expired");
        let xdeath = XDeath::from_headers(Some(&headers)).unwrap();
        assert_eq!(xdeath.reason.as_deref(), Some("expired"));
        assert_eq!(xdeath.queue.as_deref(), Some("queue.text2img"));
        assert_eq!(xdeath.count, Some(1));
    }

    #[test]
    fn missing_or_malformed_headers_yield_none() {
        assert!(XDeath::from_headers(None).is_none());
        assert!(XDeath::from_headers(Some(&FieldTable::default())).is_none());

        let mut headers = FieldTable::default();
        headers.insert("x-death".into(), AMQPValue::LongString("bogus".into()));
        assert!(XDeath::from_headers(Some(&headers)).is_none());
    }

    #[test]
    fn known_reasons_classify() {
        assert_eq!(DeadReason::from_raw("rejected"), DeadReason::Rejected);
        assert_eq!(DeadReason::from_raw("expired"), DeadReason::Expired);
        assert_eq!(DeadReason::from_raw("maxlen"), DeadReason::MaxLen);
        assert_eq!(
            DeadReason::from_raw("delivery-limit"),
            DeadReason::Unknown("delivery-limit".to_string())
        );
    }

    #[test]
    fn unknown_reason_keeps_raw_value_in_description() {
        let reason = DeadReason::from_raw("delivery-limit");
        assert!(reason.describe().contains("delivery-limit"));
    }

    #[test]
    fn status_fallback_names_the_status() {
        assert!(status_fallback(TaskStatus::Processing).contains("processing"));
    }
}
