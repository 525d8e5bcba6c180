//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub broker: BrokerHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct BrokerHealthResponse {
    pub status: String,
    pub connected: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = state.broker.is_connected().await;

    Json(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        broker: BrokerHealthResponse {
            status: if connected {
                "connected"
            } else {
                "reconnecting"
            }
            .to_string(),
            connected,
        },
    })
}
