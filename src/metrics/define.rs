//! Metric schemas.
//!
//! A [`MetricDefine`] is the fixed, ordered field table of one metric type. It is
//! built once per process and every [`Metric`] of that type points at it, so two
//! records can only be merged when they share the same table.

use super::metric::{FieldValue, Metric};
use super::wire::RemoteRecord;
use crate::core::{Result, StrataError};
use std::collections::HashSet;
use std::fmt;

/// Position of the `id` field in every schema.
pub const ID: usize = 0;
/// Position of the `metric_id` (entity key) field in every schema.
pub const METRIC_ID: usize = 1;
/// Position of the `time_bucket` field in every schema.
pub const TIME_BUCKET: usize = 2;

/// Field types a metric may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Long,
    Double,
    Integer,
    Boolean,
    Bytes,
}

impl FieldType {
    /// Wire order of the typed lists.
    pub const ALL: [FieldType; 6] = [
        FieldType::String,
        FieldType::Long,
        FieldType::Double,
        FieldType::Integer,
        FieldType::Boolean,
        FieldType::Bytes,
    ];

    pub(crate) fn ordinal(self) -> usize {
        match self {
            FieldType::String => 0,
            FieldType::Long => 1,
            FieldType::Double => 2,
            FieldType::Integer => 3,
            FieldType::Boolean => 4,
            FieldType::Bytes => 5,
        }
    }

    /// True for types `sum` can accumulate.
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double | FieldType::Integer)
    }
}

/// How an incoming value combines with the buffered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOperation {
    /// The incoming value wins.
    Overwrite,
    /// The values accumulate.
    Sum,
    /// The first value is kept forever.
    Identity,
}

/// Derived field, recomputed from the whole record after every merge.
pub type Formula = fn(&Metric) -> FieldValue;

/// One column of a schema.
#[derive(Clone)]
pub struct FieldDefine {
    name: &'static str,
    field_type: FieldType,
    merge: MergeOperation,
    formula: Option<Formula>,
    slot: usize,
}

impl FieldDefine {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn merge_operation(&self) -> MergeOperation {
        self.merge
    }

    pub fn formula(&self) -> Option<Formula> {
        self.formula
    }

    /// Index of this field inside the wire list of its type.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl fmt::Debug for FieldDefine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDefine")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("merge", &self.merge)
            .field("formula", &self.formula.is_some())
            .finish()
    }
}

/// Ordered field table of one metric type.
#[derive(Debug)]
pub struct MetricDefine {
    name: &'static str,
    fields: Vec<FieldDefine>,
    type_counts: [usize; 6],
}

impl MetricDefine {
    /// Start a schema. The `id`, `metric_id` and `time_bucket` identity fields
    /// are added first, in that order.
    pub fn builder(name: &'static str) -> MetricDefineBuilder {
        MetricDefineBuilder {
            name,
            fields: vec![
                ("id", FieldType::String, MergeOperation::Identity, None),
                ("metric_id", FieldType::String, MergeOperation::Identity, None),
                ("time_bucket", FieldType::Long, MergeOperation::Identity, None),
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> &[FieldDefine] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldDefine> {
        self.fields.get(index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Number of fields of one type, i.e. the length of its wire list.
    pub fn type_count(&self, field_type: FieldType) -> usize {
        self.type_counts[field_type.ordinal()]
    }

    pub fn has_formula(&self) -> bool {
        self.fields.iter().any(|f| f.formula.is_some())
    }

    /// A zero-valued record for `metric_id` in `time_bucket`.
    pub fn build(&'static self, metric_id: &str, time_bucket: i64) -> Metric {
        Metric::new(self, metric_id, time_bucket)
    }

    /// A record with every field at its zero value.
    pub fn empty(&'static self) -> Metric {
        Metric::empty(self)
    }

    /// Merge `from` into `into` field by field.
    pub fn merge(&self, into: &mut Metric, from: &Metric) -> Result<()> {
        if !std::ptr::eq(into.define(), self) {
            return Err(StrataError::schema(
                self.name,
                format!("target record belongs to {}", into.define().name()),
            ));
        }
        into.merge(from)
    }

    /// Wire form of a record of this type.
    pub fn serialize(&self, metric: &Metric) -> Result<RemoteRecord> {
        if metric.define().name() != self.name {
            return Err(StrataError::schema(
                self.name,
                format!("cannot serialize a {} record", metric.define().name()),
            ));
        }
        Ok(RemoteRecord::from_metric(metric))
    }

    /// Rebuild a record from its wire form.
    pub fn deserialize(&'static self, record: &RemoteRecord) -> Result<Metric> {
        record.to_metric(self)
    }
}

/// Builder of a [`MetricDefine`].
pub struct MetricDefineBuilder {
    name: &'static str,
    fields: Vec<(&'static str, FieldType, MergeOperation, Option<Formula>)>,
}

impl MetricDefineBuilder {
    /// Append a stored field.
    pub fn field(mut self, name: &'static str, field_type: FieldType, merge: MergeOperation) -> Self {
        self.fields.push((name, field_type, merge, None));
        self
    }

    /// Append a derived field.
    pub fn formula(mut self, name: &'static str, field_type: FieldType, formula: Formula) -> Self {
        self.fields
            .push((name, field_type, MergeOperation::Identity, Some(formula)));
        self
    }

    pub fn build(self) -> Result<MetricDefine> {
        let mut names = HashSet::new();
        let mut type_counts = [0usize; 6];
        let mut fields = Vec::with_capacity(self.fields.len());

        for (name, field_type, merge, formula) in self.fields {
            if !names.insert(name) {
                return Err(StrataError::schema(self.name, format!("duplicate field {}", name)));
            }
            if merge == MergeOperation::Sum && !field_type.is_numeric() {
                return Err(StrataError::schema(
                    self.name,
                    format!("field {} of type {:?} cannot be summed", name, field_type),
                ));
            }
            let counter = &mut type_counts[field_type.ordinal()];
            fields.push(FieldDefine {
                name,
                field_type,
                merge,
                formula,
                slot: *counter,
            });
            *counter += 1;
        }

        Ok(MetricDefine {
            name: self.name,
            fields,
            type_counts,
        })
    }
}
