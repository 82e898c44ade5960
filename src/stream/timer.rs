//! Periodic flush of every local worker.

use super::worker::{FlushReport, PersistenceWorker};
use crate::core::Result;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// One flush tick task per worker.
pub struct PersistenceTimer {
    tasks: Vec<JoinHandle<()>>,
}

impl PersistenceTimer {
    /// Start ticking each worker at its own flush interval.
    pub fn start(workers: &[Arc<PersistenceWorker>], shutdown: &watch::Receiver<bool>) -> Self {
        let tasks = workers
            .iter()
            .map(|worker| tokio::spawn(tick(Arc::clone(worker), shutdown.clone())))
            .collect();
        Self { tasks }
    }

    /// Wait for every tick task to observe shutdown.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Flush timer task failed: {}", e);
            }
        }
    }
}

async fn tick(worker: Arc<PersistenceWorker>, mut shutdown: watch::Receiver<bool>) {
    let period = worker.config().flush_interval;
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                // Failures are logged by the flush with the batch details.
                if let Ok(report) = worker.flush().await {
                    if report.skipped {
                        debug!(role = %worker.role(), "Flush skipped, another cycle is running");
                    }
                }
            }
        }
    }
}

/// Flush every worker concurrently and report per role.
pub async fn flush_all(workers: &[Arc<PersistenceWorker>]) -> Vec<(String, Result<FlushReport>)> {
    let flushes = workers.iter().map(|worker| async move {
        (worker.role().name().to_string(), worker.flush().await)
    });
    join_all(flushes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Role, WorkerSelector};
    use crate::metrics::catalog::service;
    use crate::metrics::{DownSampling, FieldValue};
    use crate::storage::{InMemoryStorage, StorageProvider};
    use crate::stream::worker::WorkerConfig;
    use std::time::Duration;

    fn worker(storage: &InMemoryStorage, level: DownSampling) -> Arc<PersistenceWorker> {
        let define = service::define();
        Arc::new(PersistenceWorker::new(
            Role::new(define.name(), level, WorkerSelector::HashCode),
            define,
            storage.persistence_dao(define, level),
            storage.batch_dao(),
            WorkerConfig {
                flush_interval: Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        ))
    }

    fn record() -> crate::metrics::Metric {
        service::define()
            .build("svc", 202401010930)
            .with(service::CALLS, FieldValue::Long(1))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_periodically() {
        let storage = InMemoryStorage::new();
        let minute = worker(&storage, DownSampling::Minute);
        let (stop, shutdown) = watch::channel(false);
        let timer = PersistenceTimer::start(&[Arc::clone(&minute)], &shutdown);

        minute.on_work(record()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(storage.table_len(service::NAME, DownSampling::Minute), 1);

        stop.send(true).unwrap();
        timer.join().await;
    }

    #[tokio::test]
    async fn test_flush_all_reports_every_role() {
        let storage = InMemoryStorage::new();
        let workers = vec![
            worker(&storage, DownSampling::Minute),
            worker(&storage, DownSampling::Hour),
        ];
        workers[0].on_work(record()).unwrap();

        let reports = flush_all(&workers).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "service_metric.minute");
        assert_eq!(reports[0].1.as_ref().unwrap().inserts, 1);
        assert_eq!(reports[1].1.as_ref().unwrap().drained, 0);
    }
}
