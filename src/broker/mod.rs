//! AMQP pipeline: connection management, topology, producer, consumers and
//! the dead-letter worker.
//!
//! Delivery is at-least-once. Handlers are idempotent against redelivery,
//! retries are immediate redeliveries on the same queue, and exhausted or
//! expired messages are routed to the dead-letter exchange by the broker.

mod client;
mod consumer;
mod dead_letter;
mod message;
mod producer;
mod topology;

pub use client::BrokerClient;
pub use consumer::{
    disposition_for, spawn_workers, Disposition, HandlerError, TaskHandler,
};
pub use dead_letter::{spawn_dead_letter_workers, DeadLetterProcessor, DeadReason, XDeath};
pub use message::{Img2ImgPayload, TaskMessage, TaskType, Text2ImgPayload};
pub use producer::Publisher;
pub use topology::{
    queue_for_task_type, routing_key_for_task_type, EXCHANGE_DLX, EXCHANGE_GENERATION,
    QUEUE_DEAD_LETTER, QUEUE_IMG2IMG, QUEUE_TEXT2IMG,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("broker is not connected")]
    NotConnected,

    #[error("timed out waiting for broker connection")]
    ConnectTimeout,

    #[error("publish was not confirmed by the broker")]
    NotConfirmed,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
