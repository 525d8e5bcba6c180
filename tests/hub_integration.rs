//! Notification hub integration tests
//!
//! These tests exercise the hub's single-connection-per-user policy and
//! its backpressure handling through the public handle, without a real
//! WebSocket attached.

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use nexus_pipeline::hub::{
    self, HubRegistration, PushEnvelope, PushKind, TaskCompletedData, TaskFailedData,
    TaskProgressData, OUTBOUND_QUEUE_SIZE,
};

fn registration_with_capacity(
    user_id: &str,
    capacity: usize,
) -> (HubRegistration, mpsc::Receiver<PushEnvelope>, Uuid) {
    let (tx, rx) = mpsc::channel(capacity);
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

fn registration(user_id: &str) -> (HubRegistration, mpsc::Receiver<PushEnvelope>, Uuid) {
    registration_with_capacity(user_id, OUTBOUND_QUEUE_SIZE)
}

async fn recv(rx: &mut mpsc::Receiver<PushEnvelope>) -> Option<PushEnvelope> {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for push")
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn connect_push_disconnect() {
    let handle = hub::start();
    let (reg, mut rx, client_id) = registration("user-1");
    handle.register(reg).await;

    let connected = recv(&mut rx).await.unwrap();
    assert_eq!(connected.kind, PushKind::Connected);
    assert!(connected.data["success_msg"]
        .as_str()
        .unwrap()
        .contains("user-1"));

    handle
        .send_to_user(
            "user-1",
            PushKind::TaskCompleted,
            TaskCompletedData {
                task_id: "task-1".to_string(),
                status: "completed".to_string(),
                output_image_url: "https://cdn.example/out.png".to_string(),
                generation_time_ms: 1800,
            },
        )
        .await;
    let push = recv(&mut rx).await.unwrap();
    assert_eq!(push.kind, PushKind::TaskCompleted);
    assert_eq!(push.data["output_image_url"], "https://cdn.example/out.png");

    handle.unregister(client_id, "user-1").await;

    // unregistering drops the hub's side of the queue
    assert!(recv(&mut rx).await.is_none());
}

// =============================================================================
// One connection per user
// =============================================================================

#[tokio::test]
async fn reconnect_displaces_previous_connection() {
    let handle = hub::start();

    let (first, mut first_rx, _) = registration("user-1");
    handle.register(first).await;
    assert_eq!(recv(&mut first_rx).await.unwrap().kind, PushKind::Connected);

    let (second, mut second_rx, _) = registration("user-1");
    handle.register(second).await;

    // the displaced connection's queue closes; its write pump would now
    // shut the socket down
    assert!(recv(&mut first_rx).await.is_none());
    assert_eq!(recv(&mut second_rx).await.unwrap().kind, PushKind::Connected);

    handle
        .send_to_user(
            "user-1",
            PushKind::TaskFailed,
            TaskFailedData {
                task_id: "task-1".to_string(),
                status: "failed".to_string(),
                error_message: "retry attempts exhausted".to_string(),
            },
        )
        .await;
    assert_eq!(recv(&mut second_rx).await.unwrap().kind, PushKind::TaskFailed);
}

#[tokio::test]
async fn users_are_isolated_from_each_other() {
    let handle = hub::start();

    let (alice, mut alice_rx, _) = registration("alice");
    let (bob, mut bob_rx, _) = registration("bob");
    handle.register(alice).await;
    handle.register(bob).await;
    assert_eq!(recv(&mut alice_rx).await.unwrap().kind, PushKind::Connected);
    assert_eq!(recv(&mut bob_rx).await.unwrap().kind, PushKind::Connected);

    handle
        .send_to_user(
            "alice",
            PushKind::TaskProgress,
            TaskProgressData {
                task_id: "task-a".to_string(),
                status: "processing".to_string(),
            },
        )
        .await;

    let push = recv(&mut alice_rx).await.unwrap();
    assert_eq!(push.data["task_id"], "task-a");

    // bob sees nothing
    let bob_result = timeout(Duration::from_millis(50), bob_rx.recv()).await;
    assert!(bob_result.is_err());
}

// =============================================================================
// Backpressure and offline users
// =============================================================================

#[tokio::test]
async fn slow_consumer_is_evicted_not_waited_on() {
    let handle = hub::start();

    // a queue of one: the Connected push fills it immediately, and the
    // connection never reads it
    let (slow, mut slow_rx, _) = registration_with_capacity("slow", 1);
    handle.register(slow).await;

    // a healthy second user doubles as an ordering fence: the hub works
    // each channel in FIFO order, so once the fence's pushes arrive the
    // slow user's have been handled too
    let (fence, mut fence_rx, _) = registration("fence");
    handle.register(fence).await;
    assert_eq!(recv(&mut fence_rx).await.unwrap().kind, PushKind::Connected);

    // queue is full, so this push evicts the connection instead of blocking
    handle
        .send_to_user(
            "slow",
            PushKind::TaskProgress,
            TaskProgressData {
                task_id: "task-1".to_string(),
                status: "processing".to_string(),
            },
        )
        .await;
    handle
        .send_to_user(
            "fence",
            PushKind::TaskProgress,
            TaskProgressData {
                task_id: "task-2".to_string(),
                status: "processing".to_string(),
            },
        )
        .await;
    assert_eq!(recv(&mut fence_rx).await.unwrap().kind, PushKind::TaskProgress);

    // the buffered Connected push is still readable, then the queue closes
    assert_eq!(recv(&mut slow_rx).await.unwrap().kind, PushKind::Connected);
    assert!(recv(&mut slow_rx).await.is_none());
}

#[tokio::test]
async fn pushes_to_offline_users_complete_immediately() {
    let handle = hub::start();

    for i in 0..100 {
        handle
            .send_to_user(
                "nobody",
                PushKind::TaskProgress,
                TaskProgressData {
                    task_id: format!("task-{}", i),
                    status: "processing".to_string(),
                },
            )
            .await;
    }
}

#[tokio::test]
async fn shutdown_disconnects_everyone() {
    let handle = hub::start();

    let (alice, mut alice_rx, _) = registration("alice");
    let (bob, mut bob_rx, _) = registration("bob");
    handle.register(alice).await;
    handle.register(bob).await;
    assert_eq!(recv(&mut alice_rx).await.unwrap().kind, PushKind::Connected);
    assert_eq!(recv(&mut bob_rx).await.unwrap().kind, PushKind::Connected);

    handle.close();

    assert!(recv(&mut alice_rx).await.is_none());
    assert!(recv(&mut bob_rx).await.is_none());
}
