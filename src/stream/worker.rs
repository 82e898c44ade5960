//! Aggregation worker: one metric type at one level.
//!
//! A worker owns a [`DataCache`], merges every record submitted to it and
//! persists the buffered aggregates in one batch per flush cycle. Flushes are
//! triggered inline when the buffer crosses its high-water mark, by the
//! periodic timer, and once more on shutdown.

use super::cache::{CacheStats, DataCache};
use crate::cluster::Role;
use crate::core::{Config, Result, StrataError};
use crate::metrics::{DownSampling, Metric, MetricDefine};
use crate::storage::{BatchDao, BatchRequest, MetricPersistenceDao};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Skipped final-flush attempts tolerated before giving up on shutdown.
const FINAL_FLUSH_ATTEMPTS: u32 = 50;

/// Effective settings of one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub high_water_mark: usize,
    pub flush_interval: Duration,
    pub reconcile: bool,
    pub queue_capacity: usize,
    pub consumer_batch: usize,
    pub drain_wait: Duration,
}

impl WorkerConfig {
    /// Settings of `metric_type` with engine defaults filled in.
    pub fn for_metric(config: &Config, metric_type: &str) -> Self {
        let metric = config.metric(metric_type);
        Self {
            high_water_mark: config.high_water_mark(metric_type),
            flush_interval: config.flush_interval(metric_type),
            reconcile: metric.reconcile,
            queue_capacity: config.persistence.queue_capacity,
            consumer_batch: config.persistence.consumer_batch,
            drain_wait: config.persistence.drain_wait,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::for_metric(&Config::default(), "")
    }
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Another flush held the buffer; nothing was drained.
    pub skipped: bool,
    pub drained: usize,
    pub inserts: usize,
    pub updates: usize,
    /// Records lost to schema errors while preparing the batch.
    pub dropped: usize,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Counter snapshot of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub flushes: u64,
    pub skipped_flushes: u64,
    pub inserts: u64,
    pub updates: u64,
    pub dropped: u64,
    pub failed_batches: u64,
}

#[derive(Default)]
struct WorkerCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    flushes: AtomicU64,
    skipped_flushes: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    dropped: AtomicU64,
    failed_batches: AtomicU64,
}

fn bump(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

/// Aggregates one metric type at one level and persists it in batches.
pub struct PersistenceWorker {
    role: Role,
    define: &'static MetricDefine,
    cache: DataCache,
    dao: Arc<dyn MetricPersistenceDao>,
    batch_dao: Arc<dyn BatchDao>,
    config: WorkerConfig,
    flush_lock: tokio::sync::Mutex<()>,
    counters: WorkerCounters,
}

impl PersistenceWorker {
    pub fn new(
        role: Role,
        define: &'static MetricDefine,
        dao: Arc<dyn MetricPersistenceDao>,
        batch_dao: Arc<dyn BatchDao>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            role,
            define,
            cache: DataCache::new(config.drain_wait),
            dao,
            batch_dao,
            config,
            flush_lock: tokio::sync::Mutex::new(()),
            counters: WorkerCounters::default(),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn define(&self) -> &'static MetricDefine {
        self.define
    }

    pub fn level(&self) -> DownSampling {
        self.role.level()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Merge one record into the buffer.
    ///
    /// Returns `true` when the buffer has reached its high-water mark and the
    /// caller should flush.
    pub fn on_work(&self, metric: Metric) -> Result<bool> {
        if !std::ptr::eq(metric.define(), self.define) {
            bump(&self.counters.rejected, 1);
            return Err(StrataError::schema(
                self.define.name(),
                format!("{} received a {} record", self.role, metric.define().name()),
            ));
        }
        if let Err(e) = self.cache.accept(metric) {
            bump(&self.counters.rejected, 1);
            return Err(e);
        }
        bump(&self.counters.accepted, 1);
        Ok(self.cache.current_size() >= self.config.high_water_mark)
    }

    /// Swap the buffer and persist everything drained in one batch.
    ///
    /// A storage failure drops the drained records and is returned as is;
    /// nothing is retried here.
    pub async fn flush(&self) -> Result<FlushReport> {
        let Ok(_flushing) = self.flush_lock.try_lock() else {
            bump(&self.counters.skipped_flushes, 1);
            return Ok(FlushReport::skipped());
        };
        let Some(drained) = self.cache.switch_and_drain() else {
            bump(&self.counters.skipped_flushes, 1);
            return Ok(FlushReport::skipped());
        };
        bump(&self.counters.flushes, 1);

        let mut report = FlushReport {
            drained: drained.len(),
            ..FlushReport::default()
        };
        if drained.is_empty() {
            return Ok(report);
        }

        let mut batch = Vec::with_capacity(drained.len());
        for metric in drained {
            let stored = if self.config.reconcile {
                match self.dao.get(metric.id()).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        bump(&self.counters.failed_batches, 1);
                        bump(&self.counters.dropped, report.drained);
                        error!(
                            role = %self.role,
                            drained = report.drained,
                            category = e.category(),
                            "Reconciliation read failed, dropping batch: {}",
                            e
                        );
                        return Err(e);
                    },
                }
            } else {
                None
            };

            match self.prepare(metric, stored) {
                Ok((request, true)) => {
                    report.updates += 1;
                    batch.push(request);
                },
                Ok((request, false)) => {
                    report.inserts += 1;
                    batch.push(request);
                },
                Err(e) => {
                    report.dropped += 1;
                    warn!(role = %self.role, "Dropping record: {}", e);
                },
            }
        }
        bump(&self.counters.dropped, report.dropped);

        if batch.is_empty() {
            return Ok(report);
        }

        if let Err(e) = self.batch_dao.batch_persistence(batch).await {
            bump(&self.counters.failed_batches, 1);
            bump(&self.counters.dropped, report.inserts + report.updates);
            error!(
                role = %self.role,
                inserts = report.inserts,
                updates = report.updates,
                category = e.category(),
                "Batch persistence failed, dropping batch: {}",
                e
            );
            return Err(e);
        }

        bump(&self.counters.inserts, report.inserts);
        bump(&self.counters.updates, report.updates);
        debug!(
            role = %self.role,
            drained = report.drained,
            inserts = report.inserts,
            updates = report.updates,
            "Flushed"
        );
        Ok(report)
    }

    /// Batch item for one drained record; `true` marks an update.
    fn prepare(&self, mut metric: Metric, stored: Option<Metric>) -> Result<(BatchRequest, bool)> {
        match stored {
            Some(mut stored) => {
                stored.merge(&metric)?;
                Ok((self.dao.prepare_batch_update(stored)?, true))
            },
            None => {
                metric.calculate_formula();
                Ok((self.dao.prepare_batch_insert(metric)?, false))
            },
        }
    }

    /// Flush until a cycle actually runs. Used on shutdown.
    pub async fn flush_final(&self) -> Result<FlushReport> {
        for _ in 0..FINAL_FLUSH_ATTEMPTS {
            let report = self.flush().await?;
            if !report.skipped {
                return Ok(report);
            }
            tokio::time::sleep(self.config.drain_wait).await;
        }
        Err(StrataError::Timeout {
            timeout_ms: u64::from(FINAL_FLUSH_ATTEMPTS)
                * u64::try_from(self.config.drain_wait.as_millis()).unwrap_or(u64::MAX),
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            skipped_flushes: c.skipped_flushes.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Start the consumer task draining this worker's inbound queue.
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> (WorkerHandle, JoinHandle<()>) {
        let (sender, inbox) = mpsc::channel(self.config.queue_capacity);
        let handle = WorkerHandle {
            sender,
            worker: Arc::clone(self),
        };
        let task = tokio::spawn(consume(Arc::clone(self), inbox, shutdown));
        (handle, task)
    }

    fn absorb(&self, metric: Metric) -> bool {
        match self.on_work(metric) {
            Ok(due) => due,
            Err(e) => {
                warn!(role = %self.role, category = e.category(), "Dropping record: {}", e);
                false
            },
        }
    }
}

async fn consume(
    worker: Arc<PersistenceWorker>,
    mut inbox: mpsc::Receiver<Metric>,
    mut shutdown: watch::Receiver<bool>,
) {
    let limit = worker.config.consumer_batch.max(1);
    let mut batch = Vec::with_capacity(limit);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = inbox.recv_many(&mut batch, limit) => {
                if received == 0 {
                    break;
                }
                let mut due = false;
                for metric in batch.drain(..) {
                    due |= worker.absorb(metric);
                }
                if due {
                    // Errors are logged by the flush itself.
                    let _ = worker.flush().await;
                }
            }
        }
    }

    inbox.close();
    let mut leftover = 0usize;
    while let Ok(metric) = inbox.try_recv() {
        worker.absorb(metric);
        leftover += 1;
    }

    match worker.flush_final().await {
        Ok(report) => info!(
            role = %worker.role,
            leftover,
            drained = report.drained,
            "Worker stopped"
        ),
        Err(e) => error!(role = %worker.role, "Final flush failed: {}", e),
    }
}

/// Sending side of a worker's inbound queue.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<Metric>,
    worker: Arc<PersistenceWorker>,
}

impl WorkerHandle {
    /// Queue a record, waiting for room when the queue is full.
    pub async fn submit(&self, metric: Metric) -> Result<()> {
        self.sender
            .send(metric)
            .await
            .map_err(|_| StrataError::ChannelSend)
    }

    /// Queue a record without waiting.
    pub fn try_submit(&self, metric: Metric) -> Result<()> {
        self.sender
            .try_send(metric)
            .map_err(|_| StrataError::ChannelSend)
    }

    pub fn worker(&self) -> &Arc<PersistenceWorker> {
        &self.worker
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("role", &self.worker.role.name())
            .finish_non_exhaustive()
    }
}
