//! Ambient concerns shared by every part of the engine.

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;

// Re-export commonly used types
pub use config::{
    ClusterConfig, Config, ConfigBuilder, LogLevel, LoggingConfig, MetricConfig,
    PersistenceConfig, StorageConfig,
};
pub use error::{Result, StrataError};
pub use logging::init_logging;
pub use retry::{retry_with_config, RetryConfig};
