use std::sync::Arc;

use crate::broker::{BrokerClient, Publisher};
use crate::config::Settings;
use crate::hub::HubHandle;
use crate::store::TaskStore;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub hub: HubHandle,
    pub broker: Arc<BrokerClient>,
    pub publisher: Arc<Publisher>,
    pub store: Arc<dyn TaskStore>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        hub: HubHandle,
        broker: Arc<BrokerClient>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        let publisher = Arc::new(Publisher::new(broker.clone()));

        Self {
            settings: Arc::new(settings),
            hub,
            broker,
            publisher,
            store,
            started_at: std::time::Instant::now(),
        }
    }
}
