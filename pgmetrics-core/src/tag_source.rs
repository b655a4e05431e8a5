//! Derived row producer over a batch's distinct, not-yet-admitted
//! tagsets for one measurement.

use std::collections::{BTreeMap, BTreeSet};

use crate::cache::AdmissionCache;
use crate::column::{column_from_tag, tag_id_column, Column, ColumnRole, SqlType};
use crate::db::SqlValue;
use crate::metric::MetricBatch;
use crate::source::TableSource;
use crate::tag::{tag_id_for, TagId};

pub struct TagTableSource {
    table_name: String,
    columns: Vec<Column>,
    column_names: Vec<String>,
    rows: Vec<(TagId, BTreeMap<String, String>)>,
    cursor: Option<usize>,
    tags_as_jsonb: bool,
}

impl TagTableSource {
    /// Build the source for `measurement`'s tag table. Rows already
    /// admitted (per `cache`) are excluded; the ones that remain are the
    /// rows this batch actually needs to insert.
    pub fn build(
        batch: &MetricBatch,
        measurement: &str,
        table_name: String,
        cache: &mut AdmissionCache,
        tags_as_jsonb: bool,
    ) -> Self {
        let mut seen_in_batch: BTreeSet<TagId> = BTreeSet::new();
        let mut tag_columns: BTreeMap<String, Column> = BTreeMap::new();
        let mut rows = Vec::new();

        for record in batch.records_for(measurement) {
            if !tags_as_jsonb {
                for key in record.tags.keys() {
                    tag_columns
                        .entry(key.clone())
                        .or_insert_with(|| column_from_tag(key));
                }
            }
            let id = tag_id_for(&record.tags);
            if !seen_in_batch.insert(id) {
                continue;
            }
            if cache.admitted(id) {
                continue;
            }
            rows.push((id, record.tags.clone()));
        }

        let mut columns = vec![tag_id_column()];
        if tags_as_jsonb {
            columns.push(Column {
                name: "tags".to_string(),
                role: ColumnRole::Tag,
                sql_type: SqlType::Json,
            });
        } else {
            columns.extend(tag_columns.into_values());
        }
        let column_names = columns.iter().map(|c| c.name.clone()).collect();

        Self {
            table_name,
            columns,
            column_names,
            rows,
            cursor: None,
            tags_as_jsonb,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn new_tag_ids(&self) -> Vec<TagId> {
        self.rows.iter().map(|(id, _)| *id).collect()
    }

    /// Publish this source's rows into the admission cache. Must only be
    /// called after the write that inserted them has committed.
    pub fn update_cache(&self, cache: &mut AdmissionCache) {
        for (id, _) in &self.rows {
            cache.admit(*id);
        }
    }
}

impl TableSource for TagTableSource {
    fn name(&self) -> &str {
        &self.table_name
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
        let (id, tags) = &self.rows[idx];
        self.columns
            .iter()
            .map(|column| match column.role {
                ColumnRole::TagId => SqlValue::BigInt(id.0 as i64),
                ColumnRole::Tag if self.tags_as_jsonb => {
                    SqlValue::Json(serde_json::to_string(tags).unwrap_or_else(|_| "{}".to_string()))
                }
                ColumnRole::Tag => tags
                    .get(&column.name)
                    .map(|v| SqlValue::Text(v.clone()))
                    .unwrap_or(SqlValue::Null),
                _ => SqlValue::Null,
            })
            .collect()
    }

    fn reset(&mut self) {
        self.cursor = None;
    }
}
