//! In-process notification hub.
//!
//! A single event loop owns the user → connection registry and is its only
//! mutator, so no locking is needed around it. Everything else talks to
//! the loop through bounded channels, which makes `register`, `unregister`
//! and `send_to_user` safe to call from any task.

mod client;
mod message;

pub use client::DuplexClient;
pub use message::{
    ConnectedData, PushEnvelope, PushKind, TaskCompletedData, TaskFailedData, TaskProgressData,
};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::metrics::{
    HUB_EVICTIONS_TOTAL, HUB_USERS_ONLINE, PUSHES_DELIVERED_TOTAL, PUSHES_DROPPED_TOTAL,
};

/// Capacity of each connection's outbound queue. A connection that falls
/// this far behind is considered unresponsive and gets evicted.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

const REGISTER_BUFFER: usize = 16;
const SEND_BUFFER: usize = 256;

/// What a connection hands to the hub when it comes online.
pub struct HubRegistration {
    pub client_id: Uuid,
    pub user_id: String,
    pub sender: mpsc::Sender<PushEnvelope>,
}

struct RegistryEntry {
    client_id: Uuid,
    sender: mpsc::Sender<PushEnvelope>,
}

struct HubShared {
    register_tx: mpsc::Sender<HubRegistration>,
    unregister_tx: mpsc::Sender<(Uuid, String)>,
    send_tx: mpsc::Sender<PushEnvelope>,
    done_tx: watch::Sender<bool>,
}

/// Cloneable handle used by workers, handlers and connections.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<HubShared>,
}

impl HubHandle {
    /// Register a connection. Any prior connection for the same user is
    /// evicted and its outbound queue closed.
    pub async fn register(&self, registration: HubRegistration) {
        if self.shared.register_tx.send(registration).await.is_err() {
            tracing::debug!("Hub is shut down, registration dropped");
        }
    }

    /// Remove a connection, but only if the registry still points at this
    /// exact client instance.
    pub async fn unregister(&self, client_id: Uuid, user_id: &str) {
        if self
            .shared
            .unregister_tx
            .send((client_id, user_id.to_string()))
            .await
            .is_err()
        {
            tracing::debug!("Hub is shut down, unregister dropped");
        }
    }

    /// Push an event to a user's live connection, if any.
    ///
    /// Never blocks on a slow consumer and never errors: offline users
    /// simply miss the event.
    pub async fn send_to_user(&self, user_id: &str, kind: PushKind, data: impl Serialize) {
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to serialize push data");
                return;
            }
        };

        let envelope = PushEnvelope {
            kind,
            data,
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
        };

        if self.shared.send_tx.send(envelope).await.is_err() {
            tracing::debug!(user_id = %user_id, "Hub is shut down, push dropped");
        }
    }

    /// Terminate the hub loop and close every registered outbound queue.
    pub fn close(&self) {
        let _ = self.shared.done_tx.send(true);
    }
}

/// Start the hub loop and return its handle.
pub fn start() -> HubHandle {
    let (register_tx, register_rx) = mpsc::channel(REGISTER_BUFFER);
    let (unregister_tx, unregister_rx) = mpsc::channel(REGISTER_BUFFER);
    let (send_tx, send_rx) = mpsc::channel(SEND_BUFFER);
    let (done_tx, done_rx) = watch::channel(false);

    let hub = Hub {
        clients: HashMap::new(),
        register_rx,
        unregister_rx,
        send_rx,
        done_rx,
    };

    tokio::spawn(hub.run());
    tracing::info!("Notification hub started");

    HubHandle {
        shared: Arc::new(HubShared {
            register_tx,
            unregister_tx,
            send_tx,
            done_tx,
        }),
    }
}

struct Hub {
    clients: HashMap<String, RegistryEntry>,
    register_rx: mpsc::Receiver<HubRegistration>,
    unregister_rx: mpsc::Receiver<(Uuid, String)>,
    send_rx: mpsc::Receiver<PushEnvelope>,
    done_rx: watch::Receiver<bool>,
}

impl Hub {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.done_rx.changed() => {
                    break;
                }
                Some(registration) = self.register_rx.recv() => {
                    self.register_client(registration);
                }
                Some((client_id, user_id)) = self.unregister_rx.recv() => {
                    self.unregister_client(client_id, &user_id);
                }
                Some(envelope) = self.send_rx.recv() => {
                    self.deliver(envelope);
                }
                else => break,
            }
        }

        // Dropping the senders closes every outbound queue so the write
        // pumps exit.
        self.clients.clear();
        HUB_USERS_ONLINE.set(0);
        tracing::info!("Notification hub stopped");
    }

    fn register_client(&mut self, registration: HubRegistration) {
        let user_id = registration.user_id.clone();

        if let Some(old) = self.clients.remove(&user_id) {
            // one active connection per user: drop the old sender
            HUB_EVICTIONS_TOTAL.with_label_values(&["superseded"]).inc();
            tracing::info!(
                user_id = %user_id,
                old_client_id = %old.client_id,
                "Evicted superseded connection"
            );
        }

        self.clients.insert(
            user_id.clone(),
            RegistryEntry {
                client_id: registration.client_id,
                sender: registration.sender,
            },
        );
        HUB_USERS_ONLINE.set(self.clients.len() as i64);

        tracing::info!(
            user_id = %user_id,
            client_id = %registration.client_id,
            "User connected"
        );

        self.deliver(PushEnvelope {
            kind: PushKind::Connected,
            data: serde_json::to_value(ConnectedData {
                success_msg: format!("websocket connection established for {}", user_id),
            })
            .unwrap_or_default(),
            timestamp: Utc::now(),
            user_id,
        });
    }

    fn unregister_client(&mut self, client_id: Uuid, user_id: &str) {
        // A newer registration may have superseded this client already;
        // only remove the mapping when it still points at this instance.
        let matches = self
            .clients
            .get(user_id)
            .map(|entry| entry.client_id == client_id)
            .unwrap_or(false);

        if matches {
            self.clients.remove(user_id);
            HUB_USERS_ONLINE.set(self.clients.len() as i64);
            tracing::info!(user_id = %user_id, client_id = %client_id, "User disconnected");
        }
    }

    fn deliver(&mut self, envelope: PushEnvelope) {
        let user_id = envelope.user_id.clone();

        let Some(entry) = self.clients.get(&user_id) else {
            PUSHES_DROPPED_TOTAL.inc();
            tracing::debug!(user_id = %user_id, "No live connection, push dropped");
            return;
        };

        match entry.sender.try_send(envelope) {
            Ok(()) => {
                PUSHES_DELIVERED_TOTAL.inc();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A full queue means the connection is unresponsive.
                // Evicting beats stalling the hub loop.
                tracing::warn!(user_id = %user_id, "Outbound queue full, evicting connection");
                HUB_EVICTIONS_TOTAL
                    .with_label_values(&["slow_consumer"])
                    .inc();
                self.clients.remove(&user_id);
                HUB_USERS_ONLINE.set(self.clients.len() as i64);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.clients.remove(&user_id);
                HUB_USERS_ONLINE.set(self.clients.len() as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(user_id: &str) -> (HubRegistration, mpsc::Receiver<PushEnvelope>, Uuid) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let client_id = Uuid::new_v4();
        (
            HubRegistration {
                client_id,
                user_id: user_id.to_string(),
                sender: tx,
            },
            rx,
            client_id,
        )
    }

    #[tokio::test]
    async fn registered_user_receives_connected_then_pushes() {
        let hub = start();
        let (reg, mut rx, _) = registration("u-1");
        hub.register(reg).await;

        let connected = rx.recv().await.unwrap();
        assert_eq!(connected.kind, PushKind::Connected);

        hub.send_to_user(
            "u-1",
            PushKind::TaskProgress,
            TaskProgressData {
                task_id: "t-1".to_string(),
                status: "processing".to_string(),
            },
        )
        .await;

        let push = rx.recv().await.unwrap();
        assert_eq!(push.kind, PushKind::TaskProgress);
        assert_eq!(push.data["task_id"], "t-1");

        hub.close();
    }

    #[tokio::test]
    async fn second_registration_evicts_the_first() {
        let hub = start();
        let (first, mut first_rx, _) = registration("u-1");
        hub.register(first).await;
        assert_eq!(first_rx.recv().await.unwrap().kind, PushKind::Connected);

        let (second, mut second_rx, _) = registration("u-1");
        hub.register(second).await;

        // displaced connection's queue is closed
        assert!(first_rx.recv().await.is_none());
        assert_eq!(second_rx.recv().await.unwrap().kind, PushKind::Connected);

        // pushes go to the surviving connection only
        hub.send_to_user(
            "u-1",
            PushKind::TaskCompleted,
            TaskCompletedData {
                task_id: "t-1".to_string(),
                status: "completed".to_string(),
                output_image_url: "/images/1.png".to_string(),
                generation_time_ms: 1200,
            },
        )
        .await;
        assert_eq!(second_rx.recv().await.unwrap().kind, PushKind::TaskCompleted);

        hub.close();
    }

    #[tokio::test]
    async fn stale_unregister_does_not_remove_newer_connection() {
        let hub = start();
        let (first, mut first_rx, first_id) = registration("u-1");
        hub.register(first).await;
        assert_eq!(first_rx.recv().await.unwrap().kind, PushKind::Connected);

        let (second, mut second_rx, _) = registration("u-1");
        hub.register(second).await;
        assert!(first_rx.recv().await.is_none());
        assert_eq!(second_rx.recv().await.unwrap().kind, PushKind::Connected);

        // the displaced client's own unregister must not evict its successor
        hub.unregister(first_id, "u-1").await;

        hub.send_to_user(
            "u-1",
            PushKind::TaskProgress,
            TaskProgressData {
                task_id: "t-2".to_string(),
                status: "processing".to_string(),
            },
        )
        .await;
        assert_eq!(second_rx.recv().await.unwrap().kind, PushKind::TaskProgress);

        hub.close();
    }

    #[tokio::test]
    async fn send_to_offline_user_is_a_silent_drop() {
        let hub = start();

        // must not block and must not panic
        hub.send_to_user(
            "nobody",
            PushKind::TaskFailed,
            TaskFailedData {
                task_id: "t-1".to_string(),
                status: "failed".to_string(),
                error_message: "boom".to_string(),
            },
        )
        .await;

        hub.close();
    }

    #[tokio::test]
    async fn shutdown_closes_all_outbound_queues() {
        let hub = start();
        let (reg, mut rx, _) = registration("u-1");
        hub.register(reg).await;
        assert_eq!(rx.recv().await.unwrap().kind, PushKind::Connected);

        hub.close();
        assert!(rx.recv().await.is_none());
    }
}
