//! Message handlers run by the queue consumers.

mod generation;

pub use generation::{GenerationTaskHandler, ModelScopeFactory, ProviderFactory};
