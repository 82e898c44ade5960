//! In-memory storage driver.
//!
//! Keeps one table per metric type and level. Useful for tests and for hosts
//! that only need the live aggregates.

use super::dao::{BatchDao, BatchKind, BatchRequest, MetricPersistenceDao, StorageProvider};
use crate::core::{Result, StrataError};
use crate::metrics::{DownSampling, Metric, MetricDefine};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type Table = Arc<DashMap<String, Metric>>;

/// Row written by a batch item of this driver.
#[derive(Debug, Clone)]
pub struct MemoryWrite {
    pub table: String,
    pub metric: Metric,
}

/// Counters of the in-memory driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub batches: u64,
    pub inserts: u64,
    pub updates: u64,
    pub failed_batches: u64,
}

#[derive(Default)]
struct MemoryState {
    tables: DashMap<String, Table>,
    batches: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    failed_batches: AtomicU64,
    fail_batches: AtomicUsize,
    fail_reads: AtomicBool,
}

impl MemoryState {
    fn table(&self, name: &str) -> Table {
        Arc::clone(
            self.tables
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(DashMap::new()))
                .value(),
        )
    }
}

/// In-memory storage implementing every DAO contract.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record of `metric_type` at `level`.
    pub fn get(&self, metric_type: &str, level: DownSampling, id: &str) -> Option<Metric> {
        let name = level.table_name(metric_type);
        self.state
            .tables
            .get(&name)
            .and_then(|table| table.get(id).map(|row| row.value().clone()))
    }

    /// Every record of one table.
    pub fn rows(&self, metric_type: &str, level: DownSampling) -> Vec<Metric> {
        let name = level.table_name(metric_type);
        self.state
            .tables
            .get(&name)
            .map(|table| table.iter().map(|row| row.value().clone()).collect())
            .unwrap_or_default()
    }

    pub fn table_len(&self, metric_type: &str, level: DownSampling) -> usize {
        let name = level.table_name(metric_type);
        self.state.tables.get(&name).map_or(0, |table| table.len())
    }

    /// Store a record directly, bypassing batches.
    pub fn seed(&self, level: DownSampling, metric: Metric) {
        let name = level.table_name(metric.define().name());
        self.state
            .table(&name)
            .insert(metric.id().to_string(), metric);
    }

    /// Make the next `count` batch calls fail.
    pub fn fail_next_batches(&self, count: usize) {
        self.state.fail_batches.store(count, Ordering::SeqCst);
    }

    /// Make reconciliation reads fail until turned off.
    pub fn set_reads_failing(&self, failing: bool) {
        self.state.fail_reads.store(failing, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStats {
        let s = &self.state;
        MemoryStats {
            batches: s.batches.load(Ordering::Relaxed),
            inserts: s.inserts.load(Ordering::Relaxed),
            updates: s.updates.load(Ordering::Relaxed),
            failed_batches: s.failed_batches.load(Ordering::Relaxed),
        }
    }
}

struct MemoryTableDao {
    table_name: String,
    define: &'static MetricDefine,
    table: Table,
    state: Arc<MemoryState>,
}

impl MemoryTableDao {
    fn write(&self, metric: Metric) -> Result<MemoryWrite> {
        if metric.define().name() != self.define.name() {
            return Err(StrataError::schema(
                self.define.name(),
                format!("table {} cannot hold {} records", self.table_name, metric.define().name()),
            ));
        }
        Ok(MemoryWrite {
            table: self.table_name.clone(),
            metric,
        })
    }
}

#[async_trait::async_trait]
impl MetricPersistenceDao for MemoryTableDao {
    async fn get(&self, id: &str) -> Result<Option<Metric>> {
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(StrataError::storage(format!("{} is unavailable", self.table_name)));
        }
        Ok(self.table.get(id).map(|row| row.value().clone()))
    }

    fn prepare_batch_insert(&self, metric: Metric) -> Result<BatchRequest> {
        Ok(BatchRequest::insert(self.write(metric)?))
    }

    fn prepare_batch_update(&self, metric: Metric) -> Result<BatchRequest> {
        Ok(BatchRequest::update(self.write(metric)?))
    }
}

#[async_trait::async_trait]
impl BatchDao for InMemoryStorage {
    async fn batch_persistence(&self, batch: Vec<BatchRequest>) -> Result<()> {
        let state = &self.state;
        let injected = state
            .fail_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            state.failed_batches.fetch_add(1, Ordering::Relaxed);
            return Err(StrataError::storage("bulk request rejected"));
        }

        // Reject the whole batch before writing anything.
        let mut writes = Vec::with_capacity(batch.len());
        for request in &batch {
            match request.payload::<MemoryWrite>() {
                Some(write) => writes.push((request.kind(), write)),
                None => {
                    state.failed_batches.fetch_add(1, Ordering::Relaxed);
                    return Err(StrataError::storage("batch item was not prepared by this store"));
                },
            }
        }

        for (kind, write) in writes {
            state
                .table(&write.table)
                .insert(write.metric.id().to_string(), write.metric.clone());
            match kind {
                BatchKind::Insert => state.inserts.fetch_add(1, Ordering::Relaxed),
                BatchKind::Update => state.updates.fetch_add(1, Ordering::Relaxed),
            };
        }
        state.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl StorageProvider for InMemoryStorage {
    fn persistence_dao(
        &self,
        define: &'static MetricDefine,
        level: DownSampling,
    ) -> Arc<dyn MetricPersistenceDao> {
        let table_name = level.table_name(define.name());
        Arc::new(MemoryTableDao {
            table: self.state.table(&table_name),
            table_name,
            define,
            state: Arc::clone(&self.state),
        })
    }

    fn batch_dao(&self) -> Arc<dyn BatchDao> {
        Arc::new(self.clone())
    }
}
