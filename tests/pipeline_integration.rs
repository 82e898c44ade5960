//! End-to-end tests of the standalone pipeline: ingest, merge, downsample, persist.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use strata::cluster::WorkerSelector;
use strata::core::MetricConfig;
use strata::metrics::catalog::heartbeat;
use strata::metrics::DownSampling;
use strata::storage::InMemoryStorage;
use strata::{Engine, StrataError};

async fn start(storage: &Arc<InMemoryStorage>, metric: MetricConfig) -> Engine {
    Engine::builder(quiet_config(metric), provider(storage))
        .metric(&REQUEST)
        .start()
        .await
        .unwrap()
}

fn accepted(engine: &Engine, level: DownSampling) -> u64 {
    engine
        .workers_of(REQUEST_METRIC, level)
        .iter()
        .map(|worker| worker.stats().accepted)
        .sum()
}

async fn wait_accepted(engine: &Engine, level: DownSampling, expected: u64) {
    assert!(
        eventually(|| async move { accepted(engine, level) == expected }).await,
        "{} workers accepted {} records, expected {}",
        level,
        accepted(engine, level),
        expected
    );
}

#[tokio::test]
async fn test_sum_merge_scenario() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(&storage, MetricConfig::default()).await;

    engine.ingest(TestRecordBuilder::new("A").calls(1).cost(10).build()).await.unwrap();
    engine.ingest(TestRecordBuilder::new("A").calls(1).cost(15).build()).await.unwrap();
    wait_accepted(&engine, DownSampling::Minute, 2).await;

    for (role, report) in engine.flush_all().await {
        report.unwrap_or_else(|e| panic!("{} failed: {}", role, e));
    }

    let stored = storage
        .get(REQUEST_METRIC, DownSampling::Minute, "202401010930_A")
        .unwrap();
    assert_eq!(stored.long(CALLS).unwrap(), 2);
    assert_eq!(stored.long(COST).unwrap(), 25);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_downsampling_buckets() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(&storage, MetricConfig::default()).await;

    engine.ingest(TestRecordBuilder::new("svc").build()).await.unwrap();
    for level in DownSampling::ALL {
        wait_accepted(&engine, level, 1).await;
    }
    engine.flush_all().await;

    let hour = storage.get(REQUEST_METRIC, DownSampling::Hour, "2024010109_svc").unwrap();
    assert_eq!(hour.time_bucket(), 2024010109);
    let day = storage.get(REQUEST_METRIC, DownSampling::Day, "20240101_svc").unwrap();
    assert_eq!(day.time_bucket(), 20240101);
    let month = storage.get(REQUEST_METRIC, DownSampling::Month, "202401_svc").unwrap();
    assert_eq!(month.time_bucket(), 202401);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_coarse_levels_merge_across_minutes() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(&storage, MetricConfig::default()).await;

    for bucket in [202401010930, 202401010945, 202401011000] {
        let record = TestRecordBuilder::new("svc").bucket(bucket).calls(2).build();
        engine.ingest(record).await.unwrap();
    }
    wait_accepted(&engine, DownSampling::Day, 3).await;
    wait_accepted(&engine, DownSampling::Minute, 3).await;
    engine.flush_all().await;

    assert_eq!(storage.table_len(REQUEST_METRIC, DownSampling::Minute), 3);
    assert_eq!(storage.table_len(REQUEST_METRIC, DownSampling::Hour), 2);
    let nine = storage.get(REQUEST_METRIC, DownSampling::Hour, "2024010109_svc").unwrap();
    assert_eq!(nine.long(CALLS).unwrap(), 4);
    let day = storage.get(REQUEST_METRIC, DownSampling::Day, "20240101_svc").unwrap();
    assert_eq!(day.long(CALLS).unwrap(), 6);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconciliation_scenario() {
    let storage = Arc::new(InMemoryStorage::new());
    storage.seed(DownSampling::Minute, TestRecordBuilder::new("A").calls(5).build());
    let engine = start(
        &storage,
        MetricConfig {
            levels: vec![DownSampling::Minute],
            ..MetricConfig::default()
        },
    )
    .await;

    engine.ingest(TestRecordBuilder::new("A").calls(1).build()).await.unwrap();
    wait_accepted(&engine, DownSampling::Minute, 1).await;
    let reports = engine.flush_all().await;

    let report = reports[0].1.as_ref().unwrap();
    assert_eq!((report.inserts, report.updates), (0, 1));
    let stored = storage
        .get(REQUEST_METRIC, DownSampling::Minute, "202401010930_A")
        .unwrap();
    assert_eq!(stored.long(CALLS).unwrap(), 6);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_storage_failure_drops_batch_and_recovers() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut config = quiet_config(MetricConfig {
        levels: vec![DownSampling::Minute],
        ..MetricConfig::default()
    });
    config.storage.retry.max_attempts = 1;
    let engine = Engine::builder(config, provider(&storage))
        .metric(&REQUEST)
        .start()
        .await
        .unwrap();

    storage.fail_next_batches(1);
    engine.ingest(TestRecordBuilder::new("A").build()).await.unwrap();
    wait_accepted(&engine, DownSampling::Minute, 1).await;
    let reports = engine.flush_all().await;
    assert!(matches!(reports[0].1, Err(StrataError::Storage(_))));
    assert_eq!(storage.table_len(REQUEST_METRIC, DownSampling::Minute), 0);

    let worker = &engine.workers()[0];
    assert_eq!(worker.stats().failed_batches, 1);
    assert_eq!(worker.stats().dropped, 1);

    engine.ingest(TestRecordBuilder::new("A").calls(3).build()).await.unwrap();
    wait_accepted(&engine, DownSampling::Minute, 2).await;
    engine.flush_all().await;
    let stored = storage
        .get(REQUEST_METRIC, DownSampling::Minute, "202401010930_A")
        .unwrap();
    assert_eq!(stored.long(CALLS).unwrap(), 3);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_storage_retry_policy_absorbs_transient_failures() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut config = quiet_config(MetricConfig {
        levels: vec![DownSampling::Minute],
        ..MetricConfig::default()
    });
    config.storage.retry.initial_backoff = Duration::from_millis(1);
    config.storage.retry.jitter = false;
    let engine = Engine::builder(config, provider(&storage))
        .metric(&REQUEST)
        .start()
        .await
        .unwrap();

    storage.fail_next_batches(2);
    engine.ingest(TestRecordBuilder::new("A").build()).await.unwrap();
    wait_accepted(&engine, DownSampling::Minute, 1).await;
    let reports = engine.flush_all().await;

    assert!(reports[0].1.is_ok());
    assert_eq!(storage.table_len(REQUEST_METRIC, DownSampling::Minute), 1);
    assert_eq!(storage.stats().failed_batches, 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_pending_records() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(&storage, MetricConfig::default()).await;

    for i in 0..10 {
        let record = TestRecordBuilder::new(&format!("svc-{}", i)).calls(i).build();
        engine.ingest(record).await.unwrap();
    }
    engine.shutdown().await.unwrap();

    assert_eq!(storage.table_len(REQUEST_METRIC, DownSampling::Minute), 10);
    assert_eq!(storage.table_len(REQUEST_METRIC, DownSampling::Month), 10);
}

#[tokio::test]
async fn test_high_water_mark_triggers_inline_flush() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(
        &storage,
        MetricConfig {
            high_water_mark: Some(5),
            levels: vec![DownSampling::Minute],
            ..MetricConfig::default()
        },
    )
    .await;

    for i in 0..5 {
        engine
            .ingest(TestRecordBuilder::new(&format!("svc-{}", i)).build())
            .await
            .unwrap();
    }

    let stored = &storage;
    assert!(
        eventually(|| async move { stored.table_len(REQUEST_METRIC, DownSampling::Minute) == 5 })
            .await,
        "inline flush did not persist the buffered records"
    );
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_producers_lose_nothing() {
    const PRODUCERS: i64 = 8;
    const PER_PRODUCER: i64 = 250;

    let storage = Arc::new(InMemoryStorage::new());
    let engine = Arc::new(
        start(
            &storage,
            MetricConfig {
                levels: vec![DownSampling::Minute, DownSampling::Hour],
                ..MetricConfig::default()
            },
        )
        .await,
    );

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let engine = Arc::clone(&engine);
        producers.push(tokio::spawn(async move {
            for i in 0..PER_PRODUCER {
                let entity = format!("svc-{}", (p + i) % 5);
                let record = TestRecordBuilder::new(&entity).calls(1).cost(2).build();
                engine.ingest(record).await.unwrap();
            }
        }));
    }

    let flusher = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for _ in 0..20 {
                engine.flush_all().await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    for producer in producers {
        producer.await.unwrap();
    }
    flusher.await.unwrap();

    let total = (PRODUCERS * PER_PRODUCER) as u64;
    wait_accepted(&engine, DownSampling::Minute, total).await;
    wait_accepted(&engine, DownSampling::Hour, total).await;
    engine.flush_all().await;

    let minute_calls: i64 = storage
        .rows(REQUEST_METRIC, DownSampling::Minute)
        .iter()
        .map(|m| m.long(CALLS).unwrap())
        .sum();
    let hour_cost: i64 = storage
        .rows(REQUEST_METRIC, DownSampling::Hour)
        .iter()
        .map(|m| m.long(COST).unwrap())
        .sum();
    assert_eq!(minute_calls, PRODUCERS * PER_PRODUCER);
    assert_eq!(hour_cost, 2 * PRODUCERS * PER_PRODUCER);
    assert_eq!(storage.table_len(REQUEST_METRIC, DownSampling::Minute), 5);
}

#[tokio::test]
async fn test_forever_first_routes_everything_to_one_instance() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(
        &storage,
        MetricConfig {
            selector: WorkerSelector::ForeverFirst,
            instances: 3,
            levels: vec![DownSampling::Minute],
            ..MetricConfig::default()
        },
    )
    .await;

    for i in 0..12 {
        engine
            .ingest(TestRecordBuilder::new(&format!("svc-{}", i)).build())
            .await
            .unwrap();
    }
    wait_accepted(&engine, DownSampling::Minute, 12).await;

    let workers = engine.workers_of(REQUEST_METRIC, DownSampling::Minute);
    let per_worker: Vec<u64> = workers.iter().map(|w| w.stats().accepted).collect();
    assert_eq!(per_worker, vec![12, 0, 0]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hash_code_keeps_an_id_on_one_instance() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(
        &storage,
        MetricConfig {
            instances: 4,
            levels: vec![DownSampling::Minute],
            ..MetricConfig::default()
        },
    )
    .await;

    for _ in 0..10 {
        engine.ingest(TestRecordBuilder::new("svc").build()).await.unwrap();
    }
    wait_accepted(&engine, DownSampling::Minute, 10).await;

    let workers = engine.workers_of(REQUEST_METRIC, DownSampling::Minute);
    assert_eq!(workers.len(), 4);
    let busy: Vec<u64> = workers
        .iter()
        .map(|w| w.stats().accepted)
        .filter(|&n| n > 0)
        .collect();
    assert_eq!(busy, vec![10]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejects_unknown_types_and_bad_buckets() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = start(&storage, MetricConfig::default()).await;

    let heartbeat = heartbeat::define().build("instance-1", 202401010930);
    assert!(matches!(
        engine.ingest(heartbeat).await,
        Err(StrataError::UnknownMetric(_))
    ));

    let hourly = TestRecordBuilder::new("svc").bucket(2024010109).build();
    assert!(matches!(
        engine.ingest(hourly).await,
        Err(StrataError::InvalidTimeBucket { .. })
    ));

    assert!(matches!(
        engine
            .dispatch("request_metric.week", TestRecordBuilder::new("svc").build())
            .await,
        Err(StrataError::UnknownRole(_))
    ));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_builtin_catalog_by_default() {
    let storage = Arc::new(InMemoryStorage::new());
    let engine = Engine::start(quiet_config(MetricConfig::default()), provider(&storage))
        .await
        .unwrap();

    assert!(engine.registry().role("service_metric.minute").is_some());
    assert!(engine.registry().role("instance_heartbeat.month").is_some());
    assert!(engine.registry().role("request_metric.minute").is_none());
    assert_eq!(engine.workers().len(), 16);

    engine.shutdown().await.unwrap();
}
