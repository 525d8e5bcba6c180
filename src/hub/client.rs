use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::config::WebSocketConfig;

use super::{HubHandle, HubRegistration, PushEnvelope, OUTBOUND_QUEUE_SIZE};

/// One established WebSocket connection, pumped in both directions.
///
/// The read pump enforces liveness: every inbound frame (including pongs)
/// refreshes the heartbeat deadline, and a silent peer is disconnected.
/// The write pump drains the hub-fed outbound queue and pings idle
/// connections at 90% of the heartbeat window, so a healthy peer always
/// has some frame to answer.
pub struct DuplexClient {
    client_id: Uuid,
    user_id: String,
    heartbeat_timeout: Duration,
    ping_period: Duration,
    write_timeout: Duration,
}

impl DuplexClient {
    pub fn new(user_id: String, config: &WebSocketConfig) -> Self {
        let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout_secs);
        Self {
            client_id: Uuid::new_v4(),
            user_id,
            heartbeat_timeout,
            // ping well inside the heartbeat window
            ping_period: heartbeat_timeout.mul_f64(0.9),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Drive the connection until either pump exits, then unregister.
    pub async fn run(self, socket: WebSocket, hub: HubHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<PushEnvelope>(OUTBOUND_QUEUE_SIZE);

        hub.register(HubRegistration {
            client_id: self.client_id,
            user_id: self.user_id.clone(),
            sender: outbound_tx,
        })
        .await;

        let (ws_sender, ws_receiver) = socket.split();

        let client_id = self.client_id;
        let write_timeout = self.write_timeout;
        let ping_period = self.ping_period;
        let mut write_task = tokio::spawn(async move {
            write_pump(outbound_rx, ws_sender, ping_period, write_timeout).await;
        });

        let heartbeat_timeout = self.heartbeat_timeout;
        let read_user = self.user_id.clone();
        let mut read_task = tokio::spawn(async move {
            read_pump(ws_receiver, heartbeat_timeout, &read_user).await;
        });

        tokio::select! {
            _ = &mut write_task => {
                tracing::debug!(client_id = %client_id, "Write pump finished");
                read_task.abort();
            }
            _ = &mut read_task => {
                tracing::debug!(client_id = %client_id, "Read pump finished");
                write_task.abort();
            }
        }

        hub.unregister(self.client_id, &self.user_id).await;
    }
}

async fn write_pump<S>(
    mut outbound_rx: mpsc::Receiver<PushEnvelope>,
    mut ws_sender: S,
    ping_period: Duration,
    write_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = interval(ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; consume it
    ping.tick().await;

    loop {
        let (frame, is_data) = tokio::select! {
            maybe = outbound_rx.recv() => {
                // a closed queue means the hub evicted or shut down this
                // connection
                let Some(envelope) = maybe else { break };
                let text = match serde_json::to_string(&envelope) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize push");
                        continue;
                    }
                };
                (Message::Text(text.into()), true)
            }
            _ = ping.tick() => (Message::Ping(Bytes::new()), false),
        };

        match timeout(write_timeout, ws_sender.send(frame)).await {
            Ok(Ok(())) => {
                if is_data {
                    // data frames prove the link alive; ping only on idle
                    ping.reset();
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "WebSocket send failed");
                break;
            }
            Err(_) => {
                tracing::warn!("WebSocket write timed out");
                break;
            }
        }
    }

    let _ = ws_sender.close().await;
}

async fn read_pump(
    mut ws_receiver: SplitStream<WebSocket>,
    heartbeat_timeout: Duration,
    user_id: &str,
) {
    loop {
        match timeout(heartbeat_timeout, ws_receiver.next()).await {
            Err(_) => {
                tracing::info!(user_id = %user_id, "Heartbeat timeout, closing connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(user_id = %user_id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                tracing::debug!(user_id = %user_id, "Received close frame");
                break;
            }
            // Pushes are server-to-client only; inbound payloads just
            // refresh the heartbeat deadline.
            Ok(Some(Ok(_))) => {}
        }
    }
}
