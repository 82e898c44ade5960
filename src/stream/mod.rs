//! The aggregation pipeline: merge buffers, workers, flush timer,
//! downsampling graphs and the engine tying them together.

pub mod cache;
pub mod graph;
pub mod pipeline;
pub mod timer;
pub mod worker;

pub use cache::{CacheStats, DataCache, HalfState};
pub use graph::{transform, DownsamplingGraph, GraphNode};
pub use pipeline::{Engine, EngineBuilder};
pub use timer::{flush_all, PersistenceTimer};
pub use worker::{FlushReport, PersistenceWorker, WorkerConfig, WorkerHandle, WorkerStats};
