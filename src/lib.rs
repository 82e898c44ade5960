//! Strata - streaming metric aggregation with time-pyramid persistence.
//!
//! Strata takes a concurrent stream of typed metric records, merges records
//! sharing an identity in double-buffered merge buffers, persists consistent
//! snapshots in batches and maintains the same aggregates at minute, hour,
//! day and month resolution.
//!
//! # Architecture
//!
//! - `metrics`: schemas, typed records, wire form, time buckets
//! - `stream`: merge buffers, persistence workers, flush timer,
//!   downsampling graphs and the [`Engine`]
//! - `cluster`: roles, worker selection, routing and remote dispatch
//! - `storage`: DAO contracts and the in-memory driver
//! - `core`: errors, configuration, logging, retries
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata::core::Config;
//! use strata::metrics::catalog::service;
//! use strata::metrics::FieldValue;
//! use strata::storage::InMemoryStorage;
//! use strata::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(InMemoryStorage::new());
//!     let engine = Engine::start(Config::default(), storage).await?;
//!
//!     let record = service::define()
//!         .build("checkout", 202401010930)
//!         .with(service::CALLS, FieldValue::Long(1))?;
//!     engine.ingest(record).await?;
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cluster;
pub mod core;
pub mod metrics;
pub mod storage;
pub mod stream;

// Re-export core types for convenience
pub use crate::core::{Config, Result, StrataError};
pub use crate::metrics::{DownSampling, FieldValue, Metric, MetricDefine};
pub use crate::stream::Engine;
