//! Built-in metric types.
//!
//! Each submodule exposes its field positions as constants and a `define()`
//! returning the process-wide schema.

use super::define::{FieldDefine, MetricDefine};
use crate::core::{Result, StrataError};

/// Every built-in schema.
pub fn all() -> Vec<&'static MetricDefine> {
    vec![
        service::define(),
        instance::define(),
        jvm_cpu::define(),
        heartbeat::define(),
    ]
}

/// Resolve a built-in schema by metric type name.
pub fn define_of(name: &str) -> Result<&'static MetricDefine> {
    all()
        .into_iter()
        .find(|define| define.name() == name)
        .ok_or_else(|| StrataError::UnknownMetric(name.to_string()))
}

/// Ordered field list of a built-in metric type.
pub fn attributes_of(name: &str) -> Result<&'static [FieldDefine]> {
    define_of(name).map(|define| define.fields())
}

fn ratio(total: i64, count: i64) -> i64 {
    if count == 0 {
        0
    } else {
        total / count
    }
}

/// Per-service call statistics.
pub mod service {
    use crate::metrics::define::{FieldType, MergeOperation, MetricDefine};
    use crate::metrics::metric::{FieldValue, Metric};
    use once_cell::sync::Lazy;

    pub const NAME: &str = "service_metric";

    pub const SOURCE_VALUE: usize = 3;
    pub const APPLICATION_ID: usize = 4;
    pub const CALLS: usize = 5;
    pub const ERROR_CALLS: usize = 6;
    pub const DURATION_SUM: usize = 7;
    pub const ERROR_DURATION_SUM: usize = 8;
    pub const AVERAGE_DURATION: usize = 9;
    pub const SATISFIED: usize = 10;
    pub const TOLERATING: usize = 11;
    pub const FRUSTRATED: usize = 12;

    static DEFINE: Lazy<MetricDefine> = Lazy::new(|| {
        MetricDefine::builder(NAME)
            .field("source_value", FieldType::Integer, MergeOperation::Identity)
            .field("application_id", FieldType::Integer, MergeOperation::Identity)
            .field("calls", FieldType::Long, MergeOperation::Sum)
            .field("error_calls", FieldType::Long, MergeOperation::Sum)
            .field("duration_sum", FieldType::Long, MergeOperation::Sum)
            .field("error_duration_sum", FieldType::Long, MergeOperation::Sum)
            .formula("average_duration", FieldType::Long, average_duration)
            .field("satisfied", FieldType::Long, MergeOperation::Sum)
            .field("tolerating", FieldType::Long, MergeOperation::Sum)
            .field("frustrated", FieldType::Long, MergeOperation::Sum)
            .build()
            .expect("Valid service_metric schema")
    });

    fn average_duration(metric: &Metric) -> FieldValue {
        let calls = metric.long(CALLS).unwrap_or(0);
        let sum = metric.long(DURATION_SUM).unwrap_or(0);
        FieldValue::Long(super::ratio(sum, calls))
    }

    pub fn define() -> &'static MetricDefine {
        &DEFINE
    }
}

/// Per-instance call statistics.
pub mod instance {
    use crate::metrics::define::{FieldType, MergeOperation, MetricDefine};
    use crate::metrics::metric::{FieldValue, Metric};
    use once_cell::sync::Lazy;

    pub const NAME: &str = "instance_metric";

    pub const APPLICATION_ID: usize = 3;
    pub const INSTANCE_ID: usize = 4;
    pub const CALLS: usize = 5;
    pub const ERROR_CALLS: usize = 6;
    pub const DURATION_SUM: usize = 7;
    pub const ERROR_DURATION_SUM: usize = 8;
    pub const AVERAGE_DURATION: usize = 9;

    static DEFINE: Lazy<MetricDefine> = Lazy::new(|| {
        MetricDefine::builder(NAME)
            .field("application_id", FieldType::Integer, MergeOperation::Identity)
            .field("instance_id", FieldType::Integer, MergeOperation::Identity)
            .field("calls", FieldType::Long, MergeOperation::Sum)
            .field("error_calls", FieldType::Long, MergeOperation::Sum)
            .field("duration_sum", FieldType::Long, MergeOperation::Sum)
            .field("error_duration_sum", FieldType::Long, MergeOperation::Sum)
            .formula("average_duration", FieldType::Long, average_duration)
            .build()
            .expect("Valid instance_metric schema")
    });

    fn average_duration(metric: &Metric) -> FieldValue {
        let calls = metric.long(CALLS).unwrap_or(0);
        let sum = metric.long(DURATION_SUM).unwrap_or(0);
        FieldValue::Long(super::ratio(sum, calls))
    }

    pub fn define() -> &'static MetricDefine {
        &DEFINE
    }
}

/// JVM CPU usage samples of one instance.
pub mod jvm_cpu {
    use crate::metrics::define::{FieldType, MergeOperation, MetricDefine};
    use crate::metrics::metric::{FieldValue, Metric};
    use once_cell::sync::Lazy;

    pub const NAME: &str = "instance_jvm_cpu";

    pub const INSTANCE_ID: usize = 3;
    pub const USAGE_PERCENT_SUM: usize = 4;
    pub const SAMPLES: usize = 5;
    pub const AVERAGE_USAGE: usize = 6;

    static DEFINE: Lazy<MetricDefine> = Lazy::new(|| {
        MetricDefine::builder(NAME)
            .field("instance_id", FieldType::Integer, MergeOperation::Identity)
            .field("usage_percent_sum", FieldType::Double, MergeOperation::Sum)
            .field("samples", FieldType::Long, MergeOperation::Sum)
            .formula("average_usage", FieldType::Double, average_usage)
            .build()
            .expect("Valid instance_jvm_cpu schema")
    });

    #[allow(clippy::cast_precision_loss)]
    fn average_usage(metric: &Metric) -> FieldValue {
        let samples = metric.long(SAMPLES).unwrap_or(0);
        let sum = metric.double(USAGE_PERCENT_SUM).unwrap_or(0.0);
        if samples == 0 {
            FieldValue::Double(0.0)
        } else {
            FieldValue::Double(sum / samples as f64)
        }
    }

    pub fn define() -> &'static MetricDefine {
        &DEFINE
    }
}

/// Liveness of one instance. Storage overwrite is always right for it, so it
/// is usually run without reconciliation.
pub mod heartbeat {
    use crate::metrics::define::{FieldType, MergeOperation, MetricDefine};
    use once_cell::sync::Lazy;

    pub const NAME: &str = "instance_heartbeat";

    pub const INSTANCE_ID: usize = 3;
    pub const ADDRESS: usize = 4;
    pub const HEARTBEAT_TIME: usize = 5;
    pub const ALIVE: usize = 6;
    pub const OS_INFO: usize = 7;

    static DEFINE: Lazy<MetricDefine> = Lazy::new(|| {
        MetricDefine::builder(NAME)
            .field("instance_id", FieldType::Integer, MergeOperation::Identity)
            .field("address", FieldType::String, MergeOperation::Overwrite)
            .field("heartbeat_time", FieldType::Long, MergeOperation::Overwrite)
            .field("alive", FieldType::Boolean, MergeOperation::Overwrite)
            .field("os_info", FieldType::Bytes, MergeOperation::Overwrite)
            .build()
            .expect("Valid instance_heartbeat schema")
    });

    pub fn define() -> &'static MetricDefine {
        &DEFINE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::metric::FieldValue;

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(define_of("service_metric").unwrap().name(), service::NAME);
        assert!(std::ptr::eq(define_of(heartbeat::NAME).unwrap(), heartbeat::define()));
        assert!(matches!(define_of("nope"), Err(StrataError::UnknownMetric(_))));
    }

    #[test]
    fn test_positions_match_schema() {
        let fields = attributes_of(service::NAME).unwrap();
        assert_eq!(fields[service::CALLS].name(), "calls");
        assert_eq!(fields[service::AVERAGE_DURATION].name(), "average_duration");
        assert_eq!(fields[service::FRUSTRATED].name(), "frustrated");

        let define = jvm_cpu::define();
        assert_eq!(define.index_of("average_usage"), Some(jvm_cpu::AVERAGE_USAGE));
        assert_eq!(heartbeat::define().index_of("os_info"), Some(heartbeat::OS_INFO));
        assert_eq!(instance::define().index_of("instance_id"), Some(instance::INSTANCE_ID));
    }

    #[test]
    fn test_average_duration_follows_merge() {
        let define = service::define();
        let mut a = define
            .build("svc", 202401010930)
            .with(service::CALLS, FieldValue::Long(2))
            .and_then(|m| m.with(service::DURATION_SUM, FieldValue::Long(300)))
            .unwrap();
        let b = define
            .build("svc", 202401010930)
            .with(service::CALLS, FieldValue::Long(1))
            .and_then(|m| m.with(service::DURATION_SUM, FieldValue::Long(0)))
            .unwrap();

        a.merge(&b).unwrap();
        assert_eq!(a.long(service::CALLS).unwrap(), 3);
        assert_eq!(a.long(service::AVERAGE_DURATION).unwrap(), 100);
    }

    #[test]
    fn test_average_usage_without_samples() {
        let mut metric = jvm_cpu::define().build("inst", 202401010930);
        metric.calculate_formula();
        assert_eq!(metric.double(jvm_cpu::AVERAGE_USAGE).unwrap(), 0.0);
    }
}
