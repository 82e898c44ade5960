//! Metric schemas, typed records and their wire form.
//!
//! Every metric type is described once by a [`MetricDefine`]; records of that
//! type are flat [`Metric`] values merged field by field according to the
//! schema's merge operations.

pub mod catalog;
pub mod define;
pub mod metric;
pub mod time_bucket;
pub mod wire;

pub use define::{
    FieldDefine, FieldType, Formula, MergeOperation, MetricDefine, MetricDefineBuilder, ID,
    METRIC_ID, TIME_BUCKET,
};
pub use metric::{compose_id, FieldValue, Metric};
pub use time_bucket::{
    minute_bucket, minute_bucket_from_millis, validate_minute_bucket, DownSampling,
};
pub use wire::{RemoteMessage, RemoteRecord};
