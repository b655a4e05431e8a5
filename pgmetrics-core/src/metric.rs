//! The in-memory data model a writer consumes: a batch of records, one
//! per measurement observation, each carrying a tagset and a fieldset.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A single field's value, tagged with its native width so column
/// inference never has to guess.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
}

impl FieldValue {
    /// Convert to a JSON value, for the coalesced-fieldset encoding used
    /// when `fields_as_jsonb` is set.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Bool(v) => serde_json::json!(v),
            FieldValue::I8(v) => serde_json::json!(v),
            FieldValue::I16(v) => serde_json::json!(v),
            FieldValue::I32(v) => serde_json::json!(v),
            FieldValue::I64(v) => serde_json::json!(v),
            FieldValue::U8(v) => serde_json::json!(v),
            FieldValue::U16(v) => serde_json::json!(v),
            FieldValue::U32(v) => serde_json::json!(v),
            FieldValue::U64(v) => serde_json::json!(v),
            FieldValue::F32(v) => serde_json::json!(v),
            FieldValue::F64(v) => serde_json::json!(v),
            FieldValue::Str(v) => serde_json::json!(v),
        }
    }
}

/// One measurement observation: a timestamp, a canonically-ordered
/// tagset, and a fieldset.
#[derive(Debug, Clone)]
pub struct Record {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

/// A batch of records destined for one or more measurement tables.
#[derive(Debug, Clone, Default)]
pub struct MetricBatch {
    pub records: Vec<Record>,
}

impl MetricBatch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Distinct measurement names present in the batch, in sorted order
    /// so reconciliation and logging are deterministic.
    pub fn measurements(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .records
            .iter()
            .map(|r| r.measurement.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn records_for<'a>(&'a self, measurement: &'a str) -> impl Iterator<Item = &'a Record> {
        self.records.iter().filter(move |r| r.measurement == measurement)
    }
}
