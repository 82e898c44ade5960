//! Storage DAO contracts consumed by the persistence workers.
//!
//! The engine never writes a single record: it prepares opaque batch items
//! through a [`MetricPersistenceDao`] and hands them to a [`BatchDao`] in one
//! call per flush cycle.

use crate::core::Result;
use crate::metrics::{DownSampling, Metric, MetricDefine};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Whether a batch item creates or replaces a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Insert,
    Update,
}

/// Opaque batch item prepared by a storage driver.
///
/// Only the driver that built the payload knows its concrete type.
#[derive(Clone)]
pub struct BatchRequest {
    kind: BatchKind,
    payload: Arc<dyn Any + Send + Sync>,
}

impl BatchRequest {
    pub fn insert<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            kind: BatchKind::Insert,
            payload: Arc::new(payload),
        }
    }

    pub fn update<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            kind: BatchKind::Update,
            payload: Arc::new(payload),
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Borrow the payload as the driver's concrete type.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Per-table access of one metric type at one level.
#[async_trait::async_trait]
pub trait MetricPersistenceDao: Send + Sync {
    /// Currently stored record with this id, if any.
    async fn get(&self, id: &str) -> Result<Option<Metric>>;

    /// Batch item creating `metric`.
    fn prepare_batch_insert(&self, metric: Metric) -> Result<BatchRequest>;

    /// Batch item replacing the stored copy of `metric`.
    fn prepare_batch_update(&self, metric: Metric) -> Result<BatchRequest>;
}

/// Executes prepared batches.
#[async_trait::async_trait]
pub trait BatchDao: Send + Sync {
    /// Persist every item or fail as a whole.
    async fn batch_persistence(&self, batch: Vec<BatchRequest>) -> Result<()>;
}

/// Entry point of a storage driver.
pub trait StorageProvider: Send + Sync {
    fn persistence_dao(
        &self,
        define: &'static MetricDefine,
        level: DownSampling,
    ) -> Arc<dyn MetricPersistenceDao>;

    fn batch_dao(&self) -> Arc<dyn BatchDao>;
}
