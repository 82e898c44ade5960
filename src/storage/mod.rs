//! Storage contracts and the bundled drivers.
//!
//! Real drivers (document, relational, column stores) live outside this crate
//! and plug in through [`StorageProvider`].

pub mod dao;
pub mod memory;
pub mod retrying;

// Re-export commonly used types
pub use dao::{BatchDao, BatchKind, BatchRequest, MetricPersistenceDao, StorageProvider};
pub use memory::{InMemoryStorage, MemoryStats, MemoryWrite};
pub use retrying::RetryingBatchDao;
