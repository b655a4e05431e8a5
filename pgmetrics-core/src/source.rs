//! A lazy, restartable row producer over one measurement's records.

use std::collections::BTreeMap;

use crate::column::{
    coalesce_columns, column_from_field, column_from_tag, time_column, Column, ColumnRole, SqlType,
};
use crate::db::SqlValue;
use crate::metric::{MetricBatch, Record};
use crate::tag::tag_id_for;

/// A lazy, restartable producer of rows for one table. `next` advances
/// the cursor and returns whether a row is available; `values` reads
/// the current row. `reset` rewinds to the start so a source can be
/// replayed across a retry without re-deriving its columns.
pub trait TableSource {
    fn name(&self) -> &str;
    fn columns(&self) -> &[Column];
    fn column_names(&self) -> &[String];
    fn next(&mut self) -> bool;
    fn values(&self) -> Vec<SqlValue>;
    fn reset(&mut self);
}

/// Row producer over one measurement's records, either inlining tags
/// as columns or substituting a single `tag_id` foreign key, depending
/// on `tags_as_foreign_keys`.
pub struct MetricTableSource<'a> {
    measurement: String,
    columns: Vec<Column>,
    column_names: Vec<String>,
    rows: Vec<&'a Record>,
    cursor: Option<usize>,
    tags_as_foreign_keys: bool,
    tags_as_jsonb: bool,
    fields_as_jsonb: bool,
}

impl<'a> MetricTableSource<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        batch: &'a MetricBatch,
        measurement: &str,
        use_uint8: bool,
        tags_as_foreign_keys: bool,
        tags_as_jsonb: bool,
        fields_as_jsonb: bool,
    ) -> Self {
        let rows: Vec<&Record> = batch.records_for(measurement).collect();

        let mut columns = vec![time_column()];

        if tags_as_foreign_keys {
            columns.push(crate::column::tag_id_column());
        } else if tags_as_jsonb {
            columns.push(Column {
                name: "tags".to_string(),
                role: ColumnRole::Tag,
                sql_type: SqlType::Json,
            });
        } else {
            let mut tag_names: Vec<&str> = rows
                .iter()
                .flat_map(|r| r.tags.keys())
                .map(|k| k.as_str())
                .collect();
            tag_names.sort_unstable();
            tag_names.dedup();
            columns.extend(tag_names.into_iter().map(column_from_tag));
        }

        if fields_as_jsonb {
            columns.push(Column {
                name: "fields".to_string(),
                role: ColumnRole::Field,
                sql_type: SqlType::Json,
            });
        } else {
            let mut field_columns: BTreeMap<String, Column> = BTreeMap::new();
            for record in &rows {
                for (name, value) in &record.fields {
                    let inferred = column_from_field(name, value, use_uint8);
                    field_columns
                        .entry(name.clone())
                        .and_modify(|existing| {
                            if let Ok(widened) = coalesce_columns(existing, &inferred) {
                                *existing = widened;
                            }
                        })
                        .or_insert(inferred);
                }
            }
            columns.extend(field_columns.into_values());
        }

        let column_names = columns.iter().map(|c| c.name.clone()).collect();

        Self {
            measurement: measurement.to_string(),
            columns,
            column_names,
            rows,
            cursor: None,
            tags_as_foreign_keys,
            tags_as_jsonb,
            fields_as_jsonb,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<'a> TableSource for MetricTableSource<'a> {
    fn name(&self) -> &str {
        &self.measurement
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn column_names(&self) -> &[String] {
        &self.column_names
    }

    fn next(&mut self) -> bool {
        let next_idx = match self.cursor {
            None => 0,
            Some(i) => i + 1,
        };
        if next_idx < self.rows.len() {
            self.cursor = Some(next_idx);
            true
        } else {
            false
        }
    }

    fn values(&self) -> Vec<SqlValue> {
        let idx = self.cursor.expect("values() called before next()");
        let record = self.rows[idx];
        self.columns
            .iter()
            .map(|column| match column.role {
                crate::column::ColumnRole::Time => SqlValue::TimestampTz(record.timestamp),
                crate::column::ColumnRole::TagId => {
                    SqlValue::BigInt(tag_id_for(&record.tags).0 as i64)
                }
                crate::column::ColumnRole::Tag if self.tags_as_jsonb => SqlValue::Json(
                    serde_json::to_string(&record.tags).unwrap_or_else(|_| "{}".to_string()),
                ),
                crate::column::ColumnRole::Tag => record
                    .tags
                    .get(&column.name)
                    .map(|v| SqlValue::Text(v.clone()))
                    .unwrap_or(SqlValue::Null),
                crate::column::ColumnRole::Field if self.fields_as_jsonb => {
                    let object: serde_json::Map<String, serde_json::Value> = record
                        .fields
                        .iter()
                        .map(|(name, value)| (name.clone(), value.to_json()))
                        .collect();
                    SqlValue::Json(serde_json::to_string(&object).unwrap_or_else(|_| "{}".to_string()))
                }
                crate::column::ColumnRole::Field => record
                    .fields
                    .get(&column.name)
                    .map(|v| SqlValue::from_field(v, column.sql_type))
                    .unwrap_or(SqlValue::Null),
            })
            .collect()
    }

    fn reset(&mut self) {
        self.cursor = None;
    }
}

// silence an unused-field warning: tags_as_foreign_keys is read through
// `columns`, kept on the struct for diagnostics/debug printing.
impl<'a> std::fmt::Debug for MetricTableSource<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricTableSource")
            .field("measurement", &self.measurement)
            .field("rows", &self.rows.len())
            .field("tags_as_foreign_keys", &self.tags_as_foreign_keys)
            .field("tags_as_jsonb", &self.tags_as_jsonb)
            .field("fields_as_jsonb", &self.fields_as_jsonb)
            .finish()
    }
}
