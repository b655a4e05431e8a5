//! The schema reconciler: diffs a table source against the live
//! catalog (through a small in-memory cache) and brings the table
//! up to date via user-supplied templates, never downgrading and
//! never blocking the whole write on one measurement's schema trouble.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::classify::{classify, Severity};
use crate::column::{coalesce_columns, Column};
use crate::db::DbHandle;
use crate::error::{Error, Result};
use crate::source::TableSource;
use crate::template::{qualify, quote_ident, RenderContext, TemplateSet};

#[derive(Debug, Default, Clone)]
pub struct Diff {
    pub table_missing: bool,
    pub missing_columns: Vec<Column>,
    pub conflicting_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    NoChangeNeeded,
    Created,
    Altered { added: Vec<String> },
}

struct Classified {
    severity: Severity,
    message: String,
}

pub struct TableManager {
    handle: Arc<dyn DbHandle>,
    schema: String,
    cache: RwLock<HashMap<String, Vec<Column>>>,
    create_templates: TemplateSet,
    add_column_templates: TemplateSet,
    tag_table_create_templates: TemplateSet,
    tag_table_add_column_templates: TemplateSet,
    foreign_tag_constraint: bool,
}

impl TableManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Arc<dyn DbHandle>,
        schema: String,
        create_templates: TemplateSet,
        add_column_templates: TemplateSet,
        tag_table_create_templates: TemplateSet,
        tag_table_add_column_templates: TemplateSet,
        foreign_tag_constraint: bool,
    ) -> Self {
        Self {
            handle,
            schema,
            cache: RwLock::new(HashMap::new()),
            create_templates,
            add_column_templates,
            tag_table_create_templates,
            tag_table_add_column_templates,
            foreign_tag_constraint,
        }
    }

    pub async fn match_source(&self, source: &dyn TableSource) -> Diff {
        let cache = self.cache.read().await;
        self.diff_against(source, cache.get(source.name()))
    }

    fn diff_against(&self, source: &dyn TableSource, live: Option<&Vec<Column>>) -> Diff {
        let Some(live) = live else {
            return Diff {
                table_missing: true,
                ..Default::default()
            };
        };
        let mut missing = Vec::new();
        let mut conflicting = Vec::new();
        for column in source.columns() {
            match live.iter().find(|c| c.name == column.name) {
                None => missing.push(column.clone()),
                Some(existing) => {
                    if coalesce_columns(existing, column).is_err() {
                        conflicting.push(column.name.clone());
                    }
                }
            }
        }
        Diff {
            table_missing: false,
            missing_columns: missing,
            conflicting_columns: conflicting,
        }
    }

    /// Reconcile `table` against `source`'s required columns. Returns
    /// what changed plus the names of any columns that could not be
    /// reconciled and must be dropped from the outgoing batch.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_structure(
        &self,
        table: &str,
        is_tag_table: bool,
        metric_table: &str,
        tag_table: Option<&str>,
        source: &dyn TableSource,
        diff: &Diff,
    ) -> Result<(EnsureOutcome, Vec<String>)> {
        let mut dropped = diff.conflicting_columns.clone();

        if diff.table_missing {
            // Stale cache is possible (e.g. after a connection recycle);
            // confirm against the live catalog before creating.
            if let Some(live) = self.refresh_from_catalog(table).await? {
                let redo = self.diff_against(source, Some(&live));
                dropped.extend(redo.conflicting_columns.clone());
                let (outcome, mut more) = self
                    .ensure_columns(table, is_tag_table, metric_table, tag_table, source, &redo.missing_columns)
                    .await?;
                dropped.append(&mut more);
                return Ok((outcome, dropped));
            }

            return match self
                .create_table(table, is_tag_table, metric_table, tag_table, source)
                .await
            {
                Ok(()) => {
                    self.cache
                        .write()
                        .await
                        .insert(table.to_string(), source.columns().to_vec());
                    Ok((EnsureOutcome::Created, dropped))
                }
                Err(Classified {
                    severity: Severity::Temporary,
                    ..
                }) => {
                    // A concurrent writer raced us to create the table.
                    let live = self.refresh_from_catalog(table).await?.ok_or_else(|| {
                        Error::SchemaUnresolvable {
                            table: table.to_string(),
                            message: "table still missing after a temporary create failure"
                                .to_string(),
                        }
                    })?;
                    let redo = self.diff_against(source, Some(&live));
                    dropped.extend(redo.conflicting_columns.clone());
                    let (outcome, mut more) = self
                        .ensure_columns(table, is_tag_table, metric_table, tag_table, source, &redo.missing_columns)
                        .await?;
                    dropped.append(&mut more);
                    Ok((outcome, dropped))
                }
                Err(Classified {
                    severity: Severity::Permanent,
                    message,
                }) => Err(Error::SchemaUnresolvable {
                    table: table.to_string(),
                    message,
                }),
            };
        }

        let (outcome, mut more) = self
            .ensure_columns(table, is_tag_table, metric_table, tag_table, source, &diff.missing_columns)
            .await?;
        dropped.append(&mut more);
        Ok((outcome, dropped))
    }

    async fn create_table(
        &self,
        table: &str,
        is_tag_table: bool,
        metric_table: &str,
        tag_table: Option<&str>,
        source: &dyn TableSource,
    ) -> std::result::Result<(), Classified> {
        let templates = if is_tag_table {
            &self.tag_table_create_templates
        } else {
            &self.create_templates
        };

        if templates.is_empty() {
            return Err(Classified {
                severity: Severity::Permanent,
                message: "no create template configured for this table kind".to_string(),
            });
        }

        let ctx = create_render_context(
            table,
            &self.schema,
            metric_table,
            tag_table,
            source,
            self.foreign_tag_constraint,
        );
        let statements = templates.render_all(&ctx);
        self.try_statements(&statements).await
    }

    /// Add each missing column, one ALTER per column. An empty template
    /// set means ALTER is disabled for this table kind: every missing
    /// column is dropped from the batch silently instead.
    #[allow(clippy::too_many_arguments)]
    async fn ensure_columns(
        &self,
        table: &str,
        is_tag_table: bool,
        metric_table: &str,
        tag_table: Option<&str>,
        source: &dyn TableSource,
        missing: &[Column],
    ) -> Result<(EnsureOutcome, Vec<String>)> {
        if missing.is_empty() {
            return Ok((EnsureOutcome::NoChangeNeeded, vec![]));
        }

        let templates = if is_tag_table {
            &self.tag_table_add_column_templates
        } else {
            &self.add_column_templates
        };

        if templates.is_empty() {
            let dropped: Vec<String> = missing.iter().map(|c| c.name.clone()).collect();
            tracing::warn!(
                table,
                dropped = ?dropped,
                "ALTER disabled for this table kind; dropping new columns from batch"
            );
            return Ok((EnsureOutcome::NoChangeNeeded, dropped));
        }

        let all_columns = columns_ddl(source);
        let mut added = Vec::new();
        let mut dropped = Vec::new();

        for column in missing {
            let ctx = column_render_context(
                table,
                &self.schema,
                metric_table,
                tag_table,
                column,
                &all_columns,
            );
            let statements = templates.render_all(&ctx);
            match self.try_statements(&statements).await {
                Ok(()) => added.push(column.name.clone()),
                Err(Classified {
                    severity: Severity::Temporary,
                    ..
                }) => {
                    // A concurrent ALTER likely beat us to it; confirm.
                    let confirmed = self
                        .refresh_from_catalog(table)
                        .await?
                        .map(|live| live.iter().any(|c| c.name == column.name))
                        .unwrap_or(false);
                    if confirmed {
                        added.push(column.name.clone());
                    } else {
                        tracing::warn!(
                            table,
                            column = %column.name,
                            "could not confirm a concurrently-added column; dropping from batch"
                        );
                        dropped.push(column.name.clone());
                    }
                }
                Err(Classified {
                    severity: Severity::Permanent,
                    message,
                }) => {
                    tracing::warn!(
                        table,
                        column = %column.name,
                        error = %message,
                        "permanent failure adding column; dropping from batch"
                    );
                    dropped.push(column.name.clone());
                }
            }
        }

        if !added.is_empty() {
            let mut cache = self.cache.write().await;
            let entry = cache.entry(table.to_string()).or_default();
            for column in missing.iter().filter(|c| added.contains(&c.name)) {
                if !entry.iter().any(|c| c.name == column.name) {
                    entry.push(column.clone());
                }
            }
        }

        let outcome = if added.is_empty() {
            EnsureOutcome::NoChangeNeeded
        } else {
            EnsureOutcome::Altered { added }
        };
        Ok((outcome, dropped))
    }

    async fn try_statements(&self, statements: &[String]) -> std::result::Result<(), Classified> {
        let mut last = Classified {
            severity: Severity::Permanent,
            message: "no DDL template configured".to_string(),
        };
        for statement in statements {
            match self.handle.exec(statement).await {
                Ok(_) => return Ok(()),
                Err(db_err) => {
                    let severity = classify(db_err.as_ref());
                    last = Classified {
                        severity,
                        message: db_err.to_string(),
                    };
                    if severity == Severity::Temporary {
                        break;
                    }
                }
            }
        }
        Err(last)
    }

    async fn refresh_from_catalog(&self, table: &str) -> Result<Option<Vec<Column>>> {
        let live = self
            .handle
            .query_columns(&self.schema, table)
            .await
            .map_err(|e| Error::SchemaUnresolvable {
                table: table.to_string(),
                message: e.to_string(),
            })?;
        if let Some(columns) = &live {
            self.cache
                .write()
                .await
                .insert(table.to_string(), columns.clone());
        }
        Ok(live)
    }

    /// Refresh and return a table's live columns, bypassing the cache.
    pub async fn get_columns(&self, table: &str) -> Result<Vec<Column>> {
        Ok(self.refresh_from_catalog(table).await?.unwrap_or_default())
    }

    /// Drop every cached descriptor, forcing the next `match_source` to
    /// treat every table as unknown until it's confirmed against the
    /// live catalog again.
    pub async fn clear_table_cache(&self) {
        self.cache.write().await.clear();
    }
}

fn columns_ddl(source: &dyn TableSource) -> String {
    source
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type.ddl()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_render_context(
    table: &str,
    schema: &str,
    metric_table: &str,
    tag_table: Option<&str>,
    source: &dyn TableSource,
    foreign_tag_constraint: bool,
) -> RenderContext {
    let columns = columns_ddl(source);
    RenderContext::new()
        .set("table", qualify(schema, table))
        .set("columns", columns.clone())
        .set("allColumns", columns)
        .set("metricTable", qualify(schema, metric_table))
        .set(
            "tagTable",
            tag_table.map(|t| qualify(schema, t)).unwrap_or_default(),
        )
        .set("foreign_tag_constraint", foreign_tag_constraint.to_string())
}

fn column_render_context(
    table: &str,
    schema: &str,
    metric_table: &str,
    tag_table: Option<&str>,
    column: &Column,
    all_columns: &str,
) -> RenderContext {
    let column_ddl = format!("{} {}", quote_ident(&column.name), column.sql_type.ddl());
    RenderContext::new()
        .set("table", qualify(schema, table))
        .set("column", quote_ident(&column.name))
        .set("sql_type", column.sql_type.ddl())
        .set("columns", column_ddl)
        .set("allColumns", all_columns.to_string())
        .set("metricTable", qualify(schema, metric_table))
        .set(
            "tagTable",
            tag_table.map(|t| qualify(schema, t)).unwrap_or_default(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::{MockDbError, MockHandle};
    use crate::metric::{FieldValue, MetricBatch, Record};
    use crate::source::MetricTableSource;
    use crate::template::TemplateSet;
    use chrono::Utc;

    fn batch_with_one_field(measurement: &str, field: &str, value: FieldValue) -> MetricBatch {
        MetricBatch::new(vec![Record {
            measurement: measurement.to_string(),
            tags: Default::default(),
            fields: [(field.to_string(), value)].into(),
            timestamp: Utc::now(),
        }])
    }

    fn manager(handle: Arc<MockHandle>) -> TableManager {
        TableManager::new(
            handle,
            "public".to_string(),
            TemplateSet(vec!["CREATE TABLE {table} ({columns})".into()]),
            TemplateSet(vec!["ALTER TABLE {table} ADD COLUMN {column} {sql_type}".into()]),
            TemplateSet::default(),
            TemplateSet::default(),
            true,
        )
    }

    #[tokio::test]
    async fn creates_table_on_first_write() {
        let handle = Arc::new(MockHandle::new());
        let mgr = manager(handle.clone());
        let batch = batch_with_one_field("cpu", "usage", FieldValue::F64(1.0));
        let source = MetricTableSource::build(&batch, "cpu", false, false, false, false);

        let diff = mgr.match_source(&source).await;
        assert!(diff.table_missing);
        let (outcome, dropped) = mgr
            .ensure_structure("cpu", false, "cpu", None, &source, &diff)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Created);
        assert!(dropped.is_empty());
        assert!(handle.columns_of("cpu").is_some());
    }

    #[tokio::test]
    async fn alters_on_new_field() {
        let handle = Arc::new(MockHandle::new());
        let mgr = manager(handle.clone());

        let first = batch_with_one_field("cpu", "usage", FieldValue::F64(1.0));
        let source1 = MetricTableSource::build(&first, "cpu", false, false, false, false);
        let diff1 = mgr.match_source(&source1).await;
        mgr.ensure_structure("cpu", false, "cpu", None, &source1, &diff1)
            .await
            .unwrap();

        let second = batch_with_one_field("cpu", "idle", FieldValue::F64(2.0));
        let source2 = MetricTableSource::build(&second, "cpu", false, false, false, false);
        let diff2 = mgr.match_source(&source2).await;
        assert!(!diff2.table_missing);
        assert_eq!(diff2.missing_columns.len(), 1);

        let (outcome, dropped) = mgr
            .ensure_structure("cpu", false, "cpu", None, &source2, &diff2)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Altered { added: vec!["idle".into()] });
        assert!(dropped.is_empty());
    }

    #[tokio::test]
    async fn alter_disabled_drops_new_field_silently() {
        let handle = Arc::new(MockHandle::new());
        let mgr = TableManager::new(
            handle.clone(),
            "public".to_string(),
            TemplateSet(vec!["CREATE TABLE {table} ({columns})".into()]),
            TemplateSet::default(), // empty => ALTER disabled
            TemplateSet::default(),
            TemplateSet::default(),
            true,
        );

        let first = batch_with_one_field("cpu", "usage", FieldValue::F64(1.0));
        let source1 = MetricTableSource::build(&first, "cpu", false, false, false, false);
        let diff1 = mgr.match_source(&source1).await;
        mgr.ensure_structure("cpu", false, "cpu", None, &source1, &diff1)
            .await
            .unwrap();

        let second = batch_with_one_field("cpu", "idle", FieldValue::F64(2.0));
        let source2 = MetricTableSource::build(&second, "cpu", false, false, false, false);
        let diff2 = mgr.match_source(&source2).await;
        let (outcome, dropped) = mgr
            .ensure_structure("cpu", false, "cpu", None, &source2, &diff2)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::NoChangeNeeded);
        assert_eq!(dropped, vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn permanent_alter_failure_drops_the_column() {
        let handle = Arc::new(MockHandle::new());
        let mgr = manager(handle.clone());

        let first = batch_with_one_field("cpu", "usage", FieldValue::F64(1.0));
        let source1 = MetricTableSource::build(&first, "cpu", false, false, false, false);
        let diff1 = mgr.match_source(&source1).await;
        mgr.ensure_structure("cpu", false, "cpu", None, &source1, &diff1)
            .await
            .unwrap();

        handle.fail_always_on(
            "ADD COLUMN \"idle\"",
            MockDbError::new("42601", "syntax_error_in_template"),
        );

        let second = batch_with_one_field("cpu", "idle", FieldValue::F64(2.0));
        let source2 = MetricTableSource::build(&second, "cpu", false, false, false, false);
        let diff2 = mgr.match_source(&source2).await;
        let (outcome, dropped) = mgr
            .ensure_structure("cpu", false, "cpu", None, &source2, &diff2)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::NoChangeNeeded);
        assert_eq!(dropped, vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_create_race_is_absorbed() {
        let handle = Arc::new(MockHandle::new());
        let mgr = manager(handle.clone());
        handle.fail_once_on(
            "CREATE TABLE \"public\".\"cpu\"",
            MockDbError::new("42P07", "duplicate_table"),
        );
        // Simulate the concurrent creator having already made the table
        // with the same column, visible to the next catalog query.
        handle
            .exec("CREATE TABLE \"public\".\"cpu\" (time TIMESTAMPTZ)")
            .await
            .ok();

        let batch = batch_with_one_field("cpu", "usage", FieldValue::F64(1.0));
        let source = MetricTableSource::build(&batch, "cpu", false, false, false, false);
        let diff = mgr.match_source(&source).await;
        let (outcome, dropped) = mgr
            .ensure_structure("cpu", false, "cpu", None, &source, &diff)
            .await
            .unwrap();
        assert!(dropped.is_empty());
        match outcome {
            EnsureOutcome::Created | EnsureOutcome::Altered { .. } => {}
            EnsureOutcome::NoChangeNeeded => panic!("expected the usage column to be added"),
        }
    }

    #[tokio::test]
    async fn clear_table_cache_forces_recheck() {
        let handle = Arc::new(MockHandle::new());
        let mgr = manager(handle.clone());
        let batch = batch_with_one_field("cpu", "usage", FieldValue::F64(1.0));
        let source = MetricTableSource::build(&batch, "cpu", false, false, false, false);
        let diff = mgr.match_source(&source).await;
        mgr.ensure_structure("cpu", false, "cpu", None, &source, &diff)
            .await
            .unwrap();

        mgr.clear_table_cache().await;
        let diff2 = mgr.match_source(&source).await;
        assert!(diff2.table_missing); // cache forgot, even though the table exists live
    }

    #[tokio::test]
    async fn empty_create_templates_is_a_permanent_error() {
        let handle = Arc::new(MockHandle::new());
        let mgr = TableManager::new(
            handle,
            "public".to_string(),
            TemplateSet::default(), // empty => table creation forbidden
            TemplateSet::default(),
            TemplateSet::default(),
            TemplateSet::default(),
            true,
        );
        let batch = batch_with_one_field("cpu", "usage", FieldValue::F64(1.0));
        let source = MetricTableSource::build(&batch, "cpu", false, false, false, false);
        let diff = mgr.match_source(&source).await;
        let err = mgr
            .ensure_structure("cpu", false, "cpu", None, &source, &diff)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaUnresolvable { .. }));
    }
}
