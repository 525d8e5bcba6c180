//! Prometheus metrics for the generation pipeline.
//!
//! Covers the broker connection, producer/consumer throughput, retry and
//! dead-letter accounting, and WebSocket push delivery.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "nexus";

lazy_static! {
    // ============================================================================
    // Broker Metrics
    // ============================================================================

    /// Whether the AMQP connection is currently established (0/1)
    pub static ref BROKER_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_broker_connected", METRIC_PREFIX),
        "Whether the AMQP connection is currently established"
    ).unwrap();

    /// Total reconnect attempts
    pub static ref BROKER_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broker_reconnects_total", METRIC_PREFIX),
        "Total broker reconnect attempts"
    ).unwrap();

    /// Messages published and confirmed, by routing key
    pub static ref MESSAGES_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_published_total", METRIC_PREFIX),
        "Messages published and confirmed by the broker",
        &["routing_key"]
    ).unwrap();

    /// Publish attempts that failed or were not confirmed
    pub static ref PUBLISH_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_publish_failures_total", METRIC_PREFIX),
        "Publish attempts that failed or were not confirmed"
    ).unwrap();

    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Delivery dispositions by outcome (ack, nack_requeue, nack_drop)
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Delivery attempts by disposition",
        &["queue", "disposition"]
    ).unwrap();

    /// Dead-letter messages processed, by classified reason
    pub static ref DEAD_LETTERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_dead_letters_total", METRIC_PREFIX),
        "Dead-letter messages processed by classified reason",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Push / Hub Metrics
    // ============================================================================

    /// WebSocket connections opened
    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    /// WebSocket connections closed
    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Users currently registered with the hub
    pub static ref HUB_USERS_ONLINE: IntGauge = register_int_gauge!(
        format!("{}_hub_users_online", METRIC_PREFIX),
        "Users currently registered with the notification hub"
    ).unwrap();

    /// Connections evicted because a newer connection registered, or the
    /// outbound queue filled up
    pub static ref HUB_EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_hub_evictions_total", METRIC_PREFIX),
        "Hub connection evictions by cause",
        &["cause"]
    ).unwrap();

    /// Push events delivered to an outbound queue
    pub static ref PUSHES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pushes_delivered_total", METRIC_PREFIX),
        "Push events delivered to a live connection's outbound queue"
    ).unwrap();

    /// Push events dropped because the user was offline
    pub static ref PUSHES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pushes_dropped_total", METRIC_PREFIX),
        "Push events dropped because no live connection existed"
    ).unwrap();
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_metrics() {
        BROKER_CONNECTED.set(1);
        PUSHES_DROPPED_TOTAL.inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("nexus_broker_connected"));
        assert!(output.contains("nexus_pushes_dropped_total"));
    }
}
