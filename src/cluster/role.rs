use super::selector::WorkerSelector;
use crate::metrics::DownSampling;
use std::fmt;
use std::sync::Arc;

/// Routing identity of one worker group: one metric type at one level.
///
/// Roles are created while the pipeline is built and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Role {
    name: Arc<str>,
    metric_type: &'static str,
    level: DownSampling,
    selector: WorkerSelector,
}

impl Role {
    pub fn new(metric_type: &'static str, level: DownSampling, selector: WorkerSelector) -> Self {
        Self {
            name: Arc::from(Self::name_of(metric_type, level)),
            metric_type,
            level,
            selector,
        }
    }

    /// Role name of `metric_type` at `level`, e.g. `service_metric.hour`.
    pub fn name_of(metric_type: &str, level: DownSampling) -> String {
        format!("{}.{}", metric_type, level.as_str())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric_type(&self) -> &'static str {
        self.metric_type
    }

    pub fn level(&self) -> DownSampling {
        self.level
    }

    pub fn selector(&self) -> WorkerSelector {
        self.selector
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
