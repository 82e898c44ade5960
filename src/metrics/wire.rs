//! Protobuf wire form of metric records.
//!
//! A record travels as six homogeneous lists, one per field type. A field's
//! value sits at its [`slot`](super::define::FieldDefine::slot) inside the list
//! of its type, so decoding needs the same schema the sender used.

use super::define::{FieldType, MetricDefine};
use super::metric::{FieldValue, Metric};
use crate::core::{Result, StrataError};

/// Typed lists of one metric record.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoteRecord {
    #[prost(string, repeated, tag = "1")]
    pub strings: Vec<String>,
    #[prost(int64, repeated, tag = "2")]
    pub longs: Vec<i64>,
    #[prost(double, repeated, tag = "3")]
    pub doubles: Vec<f64>,
    #[prost(int32, repeated, tag = "4")]
    pub integers: Vec<i32>,
    #[prost(bool, repeated, tag = "5")]
    pub booleans: Vec<bool>,
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub bytes: Vec<Vec<u8>>,
}

/// Envelope sent between cluster members.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoteMessage {
    /// Role name of the receiving worker group
    #[prost(string, tag = "1")]
    pub role: String,
    /// Index of the worker instance inside the role
    #[prost(uint32, tag = "2")]
    pub instance: u32,
    #[prost(message, optional, tag = "3")]
    pub record: Option<RemoteRecord>,
}

impl RemoteRecord {
    pub(crate) fn from_metric(metric: &Metric) -> Self {
        let define = metric.define();
        let mut record = RemoteRecord {
            strings: Vec::with_capacity(define.type_count(FieldType::String)),
            longs: Vec::with_capacity(define.type_count(FieldType::Long)),
            doubles: Vec::with_capacity(define.type_count(FieldType::Double)),
            integers: Vec::with_capacity(define.type_count(FieldType::Integer)),
            booleans: Vec::with_capacity(define.type_count(FieldType::Boolean)),
            bytes: Vec::with_capacity(define.type_count(FieldType::Bytes)),
        };

        // Slots are assigned in field order, so pushing in field order fills them.
        for value in metric.values() {
            match value {
                FieldValue::String(v) => record.strings.push(v.clone()),
                FieldValue::Long(v) => record.longs.push(*v),
                FieldValue::Double(v) => record.doubles.push(*v),
                FieldValue::Integer(v) => record.integers.push(*v),
                FieldValue::Boolean(v) => record.booleans.push(*v),
                FieldValue::Bytes(v) => record.bytes.push(v.clone()),
            }
        }
        record
    }

    fn list_len(&self, field_type: FieldType) -> usize {
        match field_type {
            FieldType::String => self.strings.len(),
            FieldType::Long => self.longs.len(),
            FieldType::Double => self.doubles.len(),
            FieldType::Integer => self.integers.len(),
            FieldType::Boolean => self.booleans.len(),
            FieldType::Bytes => self.bytes.len(),
        }
    }

    pub(crate) fn to_metric(&self, define: &'static MetricDefine) -> Result<Metric> {
        for field_type in FieldType::ALL {
            let expected = define.type_count(field_type);
            let found = self.list_len(field_type);
            if expected != found {
                return Err(StrataError::schema(
                    define.name(),
                    format!(
                        "wire record carries {} {:?} values, schema has {}",
                        found, field_type, expected
                    ),
                ));
            }
        }

        let values = define
            .fields()
            .iter()
            .map(|field| {
                let slot = field.slot();
                match field.field_type() {
                    FieldType::String => FieldValue::String(self.strings[slot].clone()),
                    FieldType::Long => FieldValue::Long(self.longs[slot]),
                    FieldType::Double => FieldValue::Double(self.doubles[slot]),
                    FieldType::Integer => FieldValue::Integer(self.integers[slot]),
                    FieldType::Boolean => FieldValue::Boolean(self.booleans[slot]),
                    FieldType::Bytes => FieldValue::Bytes(self.bytes[slot].clone()),
                }
            })
            .collect();

        Ok(Metric::from_values(define, values))
    }
}
