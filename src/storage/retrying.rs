//! Batch DAO wrapper retrying transient failures.

use super::dao::{BatchDao, BatchRequest};
use crate::core::{retry_with_config, Result, RetryConfig};
use std::sync::Arc;

/// Retries recoverable batch failures with exponential backoff.
///
/// Workers never retry on their own; this wrapper is where the storage retry
/// policy lives.
pub struct RetryingBatchDao {
    inner: Arc<dyn BatchDao>,
    config: RetryConfig,
}

impl RetryingBatchDao {
    pub fn new(inner: Arc<dyn BatchDao>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait::async_trait]
impl BatchDao for RetryingBatchDao {
    async fn batch_persistence(&self, batch: Vec<BatchRequest>) -> Result<()> {
        retry_with_config(&self.config, || self.inner.batch_persistence(batch.clone())).await
    }
}
