//! Downsampling fan-out of one metric type.
//!
//! The graph is fixed when the engine starts: a forward node for the minute
//! role and one transform node per coarser level. Transforms only rewrite the
//! time bucket (and the id derived from it), so replaying a record always
//! lands in the same coarser buckets.

use crate::cluster::{Registry, Role};
use crate::core::{Result, StrataError};
use crate::metrics::{validate_minute_bucket, DownSampling, Metric, MetricDefine};
use std::sync::Arc;
use tracing::warn;

/// Node of a [`DownsamplingGraph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
    /// Passes the record on unchanged.
    Forward { role: String },
    /// Rebuckets the record to `level` first.
    Transform { level: DownSampling, role: String },
}

impl GraphNode {
    pub fn role(&self) -> &str {
        match self {
            GraphNode::Forward { role } | GraphNode::Transform { role, .. } => role,
        }
    }
}

/// Copy of `metric` in the `level` bucket containing its minute bucket.
pub fn transform(level: DownSampling, metric: &Metric) -> Result<Metric> {
    metric.rebucket(level)
}

/// Fan-out of one metric type to its time levels.
pub struct DownsamplingGraph {
    define: &'static MetricDefine,
    nodes: Vec<GraphNode>,
    registry: Arc<Registry>,
}

impl DownsamplingGraph {
    /// Build the graph over `levels`. Every level must have a registered role.
    pub fn build(
        define: &'static MetricDefine,
        levels: &[DownSampling],
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let mut levels = levels.to_vec();
        levels.sort();
        levels.dedup();
        if levels.first() != Some(&DownSampling::Minute) {
            return Err(StrataError::config(format!(
                "downsampling of {} must start at minute",
                define.name()
            )));
        }

        let mut nodes = Vec::with_capacity(levels.len());
        for level in levels {
            let role = Role::name_of(define.name(), level);
            if registry.role(&role).is_none() {
                return Err(StrataError::UnknownRole(role));
            }
            nodes.push(match level {
                DownSampling::Minute => GraphNode::Forward { role },
                _ => GraphNode::Transform { level, role },
            });
        }

        Ok(Self {
            define,
            nodes,
            registry,
        })
    }

    pub fn define(&self) -> &'static MetricDefine {
        self.define
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Feed one minute record through every node.
    ///
    /// Bad input is returned as an error. A failed dispatch to one level is
    /// logged and that copy dropped; the other levels still receive theirs.
    pub async fn accept(&self, metric: Metric) -> Result<()> {
        if !std::ptr::eq(metric.define(), self.define) {
            return Err(StrataError::schema(
                self.define.name(),
                format!("graph received a {} record", metric.define().name()),
            ));
        }
        validate_minute_bucket(metric.time_bucket())?;

        for node in &self.nodes {
            let record = match node {
                GraphNode::Forward { .. } => metric.clone(),
                GraphNode::Transform { level, .. } => transform(*level, &metric)?,
            };
            if let Err(e) = self.registry.dispatch(node.role(), record).await {
                warn!(
                    role = node.role(),
                    category = e.category(),
                    "Dropping record for this cycle: {}",
                    e
                );
            }
        }
        Ok(())
    }
}
