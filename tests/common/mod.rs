//! Common test utilities and fixtures.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strata::core::{Config, ConfigBuilder, MetricConfig};
use strata::metrics::{FieldType, FieldValue, MergeOperation, Metric, MetricDefine};
use strata::storage::{InMemoryStorage, StorageProvider};

/// Field positions of the `request_metric` fixture schema.
pub const CALLS: usize = 3;
pub const COST: usize = 4;
pub const ENDPOINT: usize = 5;

pub const REQUEST_METRIC: &str = "request_metric";

/// Small schema mirroring a call counter: two sums and an overwrite.
pub static REQUEST: Lazy<MetricDefine> = Lazy::new(|| {
    MetricDefine::builder(REQUEST_METRIC)
        .field("calls", FieldType::Long, MergeOperation::Sum)
        .field("cost", FieldType::Long, MergeOperation::Sum)
        .field("endpoint", FieldType::String, MergeOperation::Overwrite)
        .build()
        .expect("Valid request_metric schema")
});

/// Fixture builder for `request_metric` records with sensible defaults.
pub struct TestRecordBuilder {
    entity: String,
    bucket: i64,
    calls: i64,
    cost: i64,
    endpoint: String,
}

impl TestRecordBuilder {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            bucket: 202401010930,
            calls: 1,
            cost: 0,
            endpoint: "/".to_string(),
        }
    }

    pub fn bucket(mut self, bucket: i64) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn calls(mut self, calls: i64) -> Self {
        self.calls = calls;
        self
    }

    pub fn cost(mut self, cost: i64) -> Self {
        self.cost = cost;
        self
    }

    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn build(self) -> Metric {
        REQUEST
            .build(&self.entity, self.bucket)
            .with(CALLS, FieldValue::Long(self.calls))
            .and_then(|m| m.with(COST, FieldValue::Long(self.cost)))
            .and_then(|m| m.with(ENDPOINT, FieldValue::String(self.endpoint)))
            .unwrap()
    }
}

/// Share an in-memory store with an engine while keeping it for assertions.
pub fn provider(storage: &Arc<InMemoryStorage>) -> Arc<dyn StorageProvider> {
    Arc::clone(storage) as Arc<dyn StorageProvider>
}

/// Standalone config whose timer never fires during a test.
pub fn quiet_config(metric: MetricConfig) -> Config {
    ConfigBuilder::new()
        .flush_interval(Duration::from_secs(3600))
        .metric(REQUEST_METRIC, metric)
        .build()
        .unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A loopback address with a port that was free a moment ago.
pub fn free_local_addr() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
