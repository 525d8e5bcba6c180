use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nexus_pipeline::broker::{
    spawn_dead_letter_workers, spawn_workers, BrokerClient, DeadLetterProcessor, TaskType,
};
use nexus_pipeline::config::Settings;
use nexus_pipeline::hub;
use nexus_pipeline::server::{create_app, AppState};
use nexus_pipeline::store::{PostgresTaskStore, TaskStore};
use nexus_pipeline::worker::{GenerationTaskHandler, ModelScopeFactory, ProviderFactory};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let store: Arc<dyn TaskStore> = Arc::new(PostgresTaskStore::connect(&settings.database).await?);
    tracing::info!("Database pool initialized");

    // Broker connects in the background and re-dials on failure; startup
    // still waits so workers have a live channel before consuming.
    let broker = BrokerClient::start(&settings.broker);
    broker
        .wait_for_connection(Duration::from_secs(settings.broker.connect_timeout_secs))
        .await?;
    tracing::info!("Broker connection established");

    let hub = hub::start();

    let factory: Arc<dyn ProviderFactory> =
        Arc::new(ModelScopeFactory::new(settings.provider.clone()));

    spawn_workers(
        settings.worker.text2img_workers,
        TaskType::Text2Img,
        broker.clone(),
        store.clone(),
        Arc::new(GenerationTaskHandler::new(
            TaskType::Text2Img,
            store.clone(),
            hub.clone(),
            factory.clone(),
            &settings.provider,
        )),
    );
    spawn_workers(
        settings.worker.img2img_workers,
        TaskType::Img2Img,
        broker.clone(),
        store.clone(),
        Arc::new(GenerationTaskHandler::new(
            TaskType::Img2Img,
            store.clone(),
            hub.clone(),
            factory.clone(),
            &settings.provider,
        )),
    );
    spawn_dead_letter_workers(
        settings.worker.dead_letter_workers,
        broker.clone(),
        Arc::new(DeadLetterProcessor::new(store.clone(), hub.clone())),
    );
    tracing::info!("Queue workers started");

    let state = AppState::new(settings.clone(), hub.clone(), broker.clone(), store);
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Closing the broker ends the consume loops; closing the hub ends
    // every live WebSocket write pump.
    broker.close().await;
    hub.close();

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
