// Engine and web server modules for Scene Forge

pub mod backends;
pub mod chunked_loader;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod logger;
pub mod memory;
pub mod model_registry;
pub mod models;
pub mod pipeline;
pub mod prompt_queue;
pub mod reclaimer;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod task_store;
pub mod tensor;
pub mod weights;

#[cfg(any(test, feature = "mock"))]
pub mod mock_backend;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, FailureReason, TaskFailure};
pub use executor::{SharedExecutor, TaskExecutor};
pub use model_registry::{ModelGroup, ModelRegistry};
pub use task_store::{TaskRecord, TaskStatus, TaskStore};
