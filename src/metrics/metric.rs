//! Flat typed metric records.

use super::define::{FieldType, MergeOperation, MetricDefine, ID, METRIC_ID, TIME_BUCKET};
use super::time_bucket::DownSampling;
use crate::core::{Result, StrataError};
use std::fmt;

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Long(i64),
    Double(f64),
    Integer(i32),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Zero value of a type.
    pub fn zero(field_type: FieldType) -> Self {
        match field_type {
            FieldType::String => FieldValue::String(String::new()),
            FieldType::Long => FieldValue::Long(0),
            FieldType::Double => FieldValue::Double(0.0),
            FieldType::Integer => FieldValue::Integer(0),
            FieldType::Boolean => FieldValue::Boolean(false),
            FieldType::Bytes => FieldValue::Bytes(Vec::new()),
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::String(_) => FieldType::String,
            FieldValue::Long(_) => FieldType::Long,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Bytes(_) => FieldType::Bytes,
        }
    }

    /// Integer sums wrap on overflow so merge order never changes the result.
    fn accumulate(&mut self, incoming: &FieldValue) -> bool {
        match (self, incoming) {
            (FieldValue::Long(a), FieldValue::Long(b)) => *a = a.wrapping_add(*b),
            (FieldValue::Double(a), FieldValue::Double(b)) => *a += *b,
            (FieldValue::Integer(a), FieldValue::Integer(b)) => *a = a.wrapping_add(*b),
            _ => return false,
        }
        true
    }
}

/// Compose the storage id of an entity in a time bucket.
pub fn compose_id(time_bucket: i64, metric_id: &str) -> String {
    format!("{}_{}", time_bucket, metric_id)
}

/// One record of a metric type, laid out positionally per its [`MetricDefine`].
#[derive(Clone)]
pub struct Metric {
    define: &'static MetricDefine,
    values: Vec<FieldValue>,
}

impl Metric {
    pub(crate) fn empty(define: &'static MetricDefine) -> Self {
        let values = define
            .fields()
            .iter()
            .map(|f| FieldValue::zero(f.field_type()))
            .collect();
        Self { define, values }
    }

    pub(crate) fn new(define: &'static MetricDefine, metric_id: &str, time_bucket: i64) -> Self {
        let mut metric = Self::empty(define);
        metric.values[ID] = FieldValue::String(compose_id(time_bucket, metric_id));
        metric.values[METRIC_ID] = FieldValue::String(metric_id.to_string());
        metric.values[TIME_BUCKET] = FieldValue::Long(time_bucket);
        metric
    }

    pub(crate) fn from_values(define: &'static MetricDefine, values: Vec<FieldValue>) -> Self {
        Self { define, values }
    }

    pub fn define(&self) -> &'static MetricDefine {
        self.define
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn id(&self) -> &str {
        match &self.values[ID] {
            FieldValue::String(s) => s,
            _ => "",
        }
    }

    pub fn metric_id(&self) -> &str {
        match &self.values[METRIC_ID] {
            FieldValue::String(s) => s,
            _ => "",
        }
    }

    pub fn time_bucket(&self) -> i64 {
        match self.values[TIME_BUCKET] {
            FieldValue::Long(v) => v,
            _ => 0,
        }
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }

    /// Set a non-identity field. The value must match the declared type.
    pub fn set(&mut self, index: usize, value: FieldValue) -> Result<()> {
        let field = self.define.field(index).ok_or_else(|| {
            StrataError::schema(self.define.name(), format!("no field at position {}", index))
        })?;
        if index <= TIME_BUCKET {
            return Err(StrataError::schema(
                self.define.name(),
                format!("identity field {} is fixed at build time", field.name()),
            ));
        }
        if field.field_type() != value.field_type() {
            return Err(StrataError::schema(
                self.define.name(),
                format!(
                    "field {} is {:?}, got {:?}",
                    field.name(),
                    field.field_type(),
                    value.field_type()
                ),
            ));
        }
        self.values[index] = value;
        Ok(())
    }

    /// Builder-style [`Metric::set`].
    pub fn with(mut self, index: usize, value: FieldValue) -> Result<Self> {
        self.set(index, value)?;
        Ok(self)
    }

    pub fn long(&self, index: usize) -> Result<i64> {
        match self.values.get(index) {
            Some(FieldValue::Long(v)) => Ok(*v),
            other => Err(self.type_error(index, FieldType::Long, other)),
        }
    }

    pub fn double(&self, index: usize) -> Result<f64> {
        match self.values.get(index) {
            Some(FieldValue::Double(v)) => Ok(*v),
            other => Err(self.type_error(index, FieldType::Double, other)),
        }
    }

    pub fn integer(&self, index: usize) -> Result<i32> {
        match self.values.get(index) {
            Some(FieldValue::Integer(v)) => Ok(*v),
            other => Err(self.type_error(index, FieldType::Integer, other)),
        }
    }

    pub fn boolean(&self, index: usize) -> Result<bool> {
        match self.values.get(index) {
            Some(FieldValue::Boolean(v)) => Ok(*v),
            other => Err(self.type_error(index, FieldType::Boolean, other)),
        }
    }

    pub fn string(&self, index: usize) -> Result<&str> {
        match self.values.get(index) {
            Some(FieldValue::String(v)) => Ok(v),
            other => Err(self.type_error(index, FieldType::String, other)),
        }
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match self.values.get(index) {
            Some(FieldValue::Bytes(v)) => Ok(v),
            other => Err(self.type_error(index, FieldType::Bytes, other)),
        }
    }

    fn type_error(&self, index: usize, wanted: FieldType, found: Option<&FieldValue>) -> StrataError {
        let found = match found {
            Some(value) => format!("{:?}", value.field_type()),
            None => "nothing".to_string(),
        };
        StrataError::schema(
            self.define.name(),
            format!("field {} read as {:?}, holds {}", index, wanted, found),
        )
    }

    /// Combine `incoming` into this record with each field's merge operation,
    /// then recompute formula fields.
    ///
    /// Both records must come from the same schema; a mismatch fails before
    /// any field is touched.
    pub fn merge(&mut self, incoming: &Metric) -> Result<()> {
        self.check_compatible(incoming)?;

        for (i, field) in self.define.fields().iter().enumerate() {
            match field.merge_operation() {
                MergeOperation::Identity => {},
                MergeOperation::Overwrite => self.values[i] = incoming.values[i].clone(),
                MergeOperation::Sum => {
                    self.values[i].accumulate(&incoming.values[i]);
                },
            }
        }

        self.calculate_formula();
        Ok(())
    }

    fn check_compatible(&self, other: &Metric) -> Result<()> {
        if !std::ptr::eq(self.define, other.define) && self.define.name() != other.define.name() {
            return Err(StrataError::schema(
                self.define.name(),
                format!("cannot merge a {} record", other.define.name()),
            ));
        }
        if self.values.len() != other.values.len() || self.values.len() != self.define.len() {
            return Err(StrataError::schema(
                self.define.name(),
                format!(
                    "field count {} does not match {}",
                    other.values.len(),
                    self.values.len()
                ),
            ));
        }
        for (i, field) in self.define.fields().iter().enumerate() {
            if self.values[i].field_type() != field.field_type()
                || other.values[i].field_type() != field.field_type()
            {
                return Err(StrataError::schema(
                    self.define.name(),
                    format!("field {} is not {:?} on both sides", field.name(), field.field_type()),
                ));
            }
        }
        Ok(())
    }

    /// Recompute every formula field from the current values.
    pub fn calculate_formula(&mut self) {
        for (i, field) in self.define.fields().iter().enumerate() {
            if let Some(formula) = field.formula() {
                let value = formula(self);
                if value.field_type() == field.field_type() {
                    self.values[i] = value;
                }
            }
        }
    }

    /// Copy of this record moved into the bucket of a coarser level.
    pub fn rebucket(&self, level: DownSampling) -> Result<Metric> {
        let bucket = level.from_minute_bucket(self.time_bucket())?;
        let mut metric = self.clone();
        metric.values[ID] = FieldValue::String(compose_id(bucket, self.metric_id()));
        metric.values[TIME_BUCKET] = FieldValue::Long(bucket);
        Ok(metric)
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.define.name() == other.define.name() && self.values == other.values
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (field, value) in self.define.fields().iter().zip(&self.values) {
            map.entry(&field.name(), value);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::define::MetricDefine;
    use once_cell::sync::Lazy;

    static SAMPLE: Lazy<MetricDefine> = Lazy::new(|| {
        MetricDefine::builder("sample")
            .field("calls", FieldType::Long, MergeOperation::Sum)
            .field("cost", FieldType::Long, MergeOperation::Sum)
            .field("last_host", FieldType::String, MergeOperation::Overwrite)
            .field("ratio", FieldType::Double, MergeOperation::Sum)
            .field("first_seen", FieldType::Long, MergeOperation::Identity)
            .formula("avg_cost", FieldType::Long, |m| {
                let calls = m.long(3).unwrap_or(0);
                let cost = m.long(4).unwrap_or(0);
                FieldValue::Long(if calls == 0 { 0 } else { cost / calls })
            })
            .build()
            .expect("Valid sample schema")
    });

    static OTHER: Lazy<MetricDefine> = Lazy::new(|| {
        MetricDefine::builder("other")
            .field("calls", FieldType::Double, MergeOperation::Sum)
            .build()
            .expect("other schema")
    });

    fn sample(calls: i64, cost: i64, host: &str) -> Metric {
        SAMPLE
            .build("svc-a", 202401010930)
            .with(3, FieldValue::Long(calls))
            .and_then(|m| m.with(4, FieldValue::Long(cost)))
            .and_then(|m| m.with(5, FieldValue::String(host.to_string())))
            .unwrap()
    }

    #[test]
    fn test_build_sets_identity() {
        let m = SAMPLE.build("svc-a", 202401010930);
        assert_eq!(m.id(), "202401010930_svc-a");
        assert_eq!(m.metric_id(), "svc-a");
        assert_eq!(m.time_bucket(), 202401010930);
    }

    #[test]
    fn test_sum_merge() {
        let mut a = sample(1, 10, "h1");
        a.merge(&sample(1, 15, "h2")).unwrap();

        assert_eq!(a.long(3).unwrap(), 2);
        assert_eq!(a.long(4).unwrap(), 25);
        assert_eq!(a.string(5).unwrap(), "h2");
        assert_eq!(a.long(8).unwrap(), 12);
    }

    #[test]
    fn test_identity_is_never_overwritten() {
        let mut a = sample(1, 1, "h").with(7, FieldValue::Long(100)).unwrap();
        let b = sample(1, 1, "h").with(7, FieldValue::Long(200)).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.long(7).unwrap(), 100);
        assert_eq!(a.id(), "202401010930_svc-a");
    }

    #[test]
    fn test_merge_order_independent_for_sums() {
        let records = [sample(1, 10, "h"), sample(3, 7, "h"), sample(2, 40, "h")];

        let mut forward = records[0].clone();
        forward.merge(&records[1]).unwrap();
        forward.merge(&records[2]).unwrap();

        let mut backward = records[2].clone();
        backward.merge(&records[1]).unwrap();
        backward.merge(&records[0]).unwrap();

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_sum_overflow_is_order_independent() {
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        let ints = [FieldValue::Integer(i32::MAX), FieldValue::Integer(1), FieldValue::Integer(-1)];
        let longs = [FieldValue::Long(i64::MAX), FieldValue::Long(1), FieldValue::Long(-1)];
        for values in [ints, longs] {
            let totals: Vec<FieldValue> = orders
                .iter()
                .map(|order| {
                    let mut total = values[order[0]].clone();
                    assert!(total.accumulate(&values[order[1]]));
                    assert!(total.accumulate(&values[order[2]]));
                    total
                })
                .collect();
            assert!(totals.iter().all(|t| *t == values[0]), "{:?}", totals);
        }
    }

    #[test]
    fn test_schema_mismatch_fails_fast() {
        let mut a = sample(1, 10, "h");
        let before = a.clone();
        let other = OTHER.build("svc-a", 202401010930);

        let err = a.merge(&other).unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch { .. }));
        assert_eq!(a, before);
    }

    #[test]
    fn test_set_rejects_wrong_type_and_identity() {
        let mut m = SAMPLE.build("svc-a", 202401010930);
        assert!(m.set(3, FieldValue::Double(1.0)).is_err());
        assert!(m.set(TIME_BUCKET, FieldValue::Long(1)).is_err());
        assert!(m.set(99, FieldValue::Long(1)).is_err());
    }

    #[test]
    fn test_rebucket_rewrites_id_and_bucket() {
        let m = sample(1, 10, "h");
        let hour = m.rebucket(DownSampling::Hour).unwrap();
        assert_eq!(hour.time_bucket(), 2024010109);
        assert_eq!(hour.id(), "2024010109_svc-a");
        assert_eq!(hour.long(3).unwrap(), 1);
    }
}
