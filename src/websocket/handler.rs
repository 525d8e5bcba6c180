use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::hub::DuplexClient;
use crate::metrics::{WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Authentication happens at the gateway in front of this service; by the
/// time a request lands here the user id in the query string is trusted.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query),
    fields(has_user_id = query.user_id.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let user_id = match query.user_id.filter(|u| !u.is_empty()) {
        Some(u) => u,
        None => {
            return (StatusCode::BAD_REQUEST, "Missing user_id").into_response();
        }
    };

    tracing::info!(user_id = %user_id, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

#[tracing::instrument(name = "ws.connection", skip(socket, state), fields(user_id = %user_id))]
async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let connection_start = std::time::Instant::now();
    WS_CONNECTIONS_OPENED.inc();

    let client = DuplexClient::new(user_id.clone(), &state.settings.websocket);
    let client_id = client.client_id();

    tracing::info!(
        client_id = %client_id,
        user_id = %user_id,
        "WebSocket connection established"
    );

    client.run(socket, state.hub.clone()).await;

    WS_CONNECTIONS_CLOSED.inc();
    tracing::info!(
        client_id = %client_id,
        user_id = %user_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}
