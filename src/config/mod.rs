mod settings;

pub use settings::{
    BrokerConfig, DatabaseConfig, ProviderConfig, ServerConfig, Settings, WebSocketConfig,
    WorkerConfig,
};
