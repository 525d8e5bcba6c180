//! Exchange, queue and binding declarations.
//!
//! Task queues are TTL- and length-bounded and point at the dead-letter
//! exchange, so expiry, overflow and explicit rejection all end up on the
//! dead-letter queue. Declaration is idempotent at the broker; an argument
//! mismatch against a pre-existing queue surfaces as a channel error.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::ExchangeKind;

use super::{BrokerClient, BrokerError, TaskType};

pub const EXCHANGE_GENERATION: &str = "exchange.generation.image";
pub const EXCHANGE_DLX: &str = "exchange.generation.dlx";

pub const QUEUE_TEXT2IMG: &str = "queue.text2img";
pub const QUEUE_IMG2IMG: &str = "queue.img2img";
pub const QUEUE_DEAD_LETTER: &str = "queue.dead_letter";

pub const ROUTING_KEY_TEXT2IMG: &str = "generation.text2img";
pub const ROUTING_KEY_IMG2IMG: &str = "generation.img2img";
pub const ROUTING_KEY_DEAD_LETTER: &str = "dead_letter";

/// 30 minutes: a task older than this is stale, dead-letter it
const TASK_QUEUE_TTL_MS: i32 = 1_800_000;
/// Backlog bound per task queue
const TASK_QUEUE_MAX_LENGTH: i32 = 1000;
/// 7 days: dead letters stay inspectable for a week
const DEAD_LETTER_TTL_MS: i32 = 604_800_000;

pub fn routing_key_for_task_type(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Text2Img => ROUTING_KEY_TEXT2IMG,
        TaskType::Img2Img => ROUTING_KEY_IMG2IMG,
    }
}

pub fn queue_for_task_type(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Text2Img => QUEUE_TEXT2IMG,
        TaskType::Img2Img => QUEUE_IMG2IMG,
    }
}

fn task_queue_args() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-message-ttl".into(), AMQPValue::LongInt(TASK_QUEUE_TTL_MS));
    args.insert(
        "x-max-length".into(),
        AMQPValue::LongInt(TASK_QUEUE_MAX_LENGTH),
    );
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(EXCHANGE_DLX.into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(ROUTING_KEY_DEAD_LETTER.into()),
    );
    args
}

/// Declare the full topology on the shared channel.
pub(super) async fn declare_all(client: &BrokerClient) -> Result<(), BrokerError> {
    let channel = client.channel().await?;

    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            EXCHANGE_GENERATION,
            ExchangeKind::Topic,
            durable,
            FieldTable::default(),
        )
        .await?;

    channel
        .exchange_declare(EXCHANGE_DLX, ExchangeKind::Direct, durable, FieldTable::default())
        .await?;

    let durable_queue = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    for task_type in [TaskType::Text2Img, TaskType::Img2Img] {
        let queue = queue_for_task_type(task_type);
        channel
            .queue_declare(queue, durable_queue, task_queue_args())
            .await?;
        channel
            .queue_bind(
                queue,
                EXCHANGE_GENERATION,
                routing_key_for_task_type(task_type),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    let mut dlq_args = FieldTable::default();
    dlq_args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongInt(DEAD_LETTER_TTL_MS),
    );
    channel
        .queue_declare(QUEUE_DEAD_LETTER, durable_queue, dlq_args)
        .await?;
    channel
        .queue_bind(
            QUEUE_DEAD_LETTER,
            EXCHANGE_DLX,
            ROUTING_KEY_DEAD_LETTER,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    tracing::info!("Broker topology declared");
    Ok(())
}
