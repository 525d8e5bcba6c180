// Infrastructure layer (shared components)
pub mod config;
pub mod error;
pub mod metrics;

// Pipeline core
pub mod broker;
pub mod hub;
pub mod provider;
pub mod store;
pub mod worker;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;
