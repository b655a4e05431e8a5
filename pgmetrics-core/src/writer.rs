//! The write path: reconcile schema, merge tag rows, bulk-copy field
//! rows. One connection wraps the whole batch in a transaction, with
//! each measurement writing inside its own savepoint so one
//! measurement's permanent failure rolls back only that savepoint and
//! lets the rest of the batch commit. More than one connection splits
//! the batch per measurement across a bounded worker pool; each
//! sub-batch commits independently and retries on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::sleep;

use crate::cache::AdmissionCache;
use crate::classify::{classify, Severity};
use crate::config::Config;
use crate::db::{DbHandle, SqlValue};
use crate::error::{Error, Result};
use crate::manager::TableManager;
use crate::metric::{MetricBatch, Record};
use crate::source::{MetricTableSource, TableSource};
use crate::tag_source::TagTableSource;
use crate::template::{qualify, quote_ident};

static TEMP_TABLE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of writing one batch: how many rows landed, and which
/// columns across which tables were dropped because their schema
/// could not be reconciled (ALTER disabled, a type conflict, or a
/// permanent DDL failure).
#[derive(Debug, Default, Clone)]
pub struct WriteReport {
    pub rows_written: u64,
    pub tag_rows_written: u64,
    pub dropped_columns: HashMap<String, Vec<String>>,
}

impl WriteReport {
    fn merge(&mut self, other: WriteReport) {
        self.rows_written += other.rows_written;
        self.tag_rows_written += other.tag_rows_written;
        for (table, columns) in other.dropped_columns {
            self.dropped_columns.entry(table).or_default().extend(columns);
        }
    }
}

enum PoolMessage {
    Write(MetricBatch, oneshot::Sender<WriteReport>),
    Shutdown,
}

/// The output adapter's entry point. Construct once per configured
/// connection, then call [`Writer::write`] for each batch.
pub struct Writer {
    config: Arc<Config>,
    manager: Arc<TableManager>,
    handle: Arc<dyn DbHandle>,
    tag_cache: Arc<Mutex<AdmissionCache>>,
    pool: Option<mpsc::Sender<PoolMessage>>,
    closed: AtomicBool,
}

impl Writer {
    /// Connect and prepare a writer: validates `config`, builds the
    /// worker pool for the concurrent path, and primes the table
    /// manager's cache empty (population happens lazily on first
    /// write). `handle` is the already-established database connection
    /// this writer drives; establishing it is out of this crate's
    /// scope (see [`crate::db`]).
    pub async fn connect(handle: Arc<dyn DbHandle>, config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let manager = Arc::new(TableManager::new(
            handle.clone(),
            config.connection.schema.clone(),
            config.create_templates.clone(),
            config.add_column_templates.clone(),
            config.tag_table_create_templates.clone(),
            config.tag_table_add_column_templates.clone(),
            config.foreign_tag_constraint,
        ));
        let tag_cache = Arc::new(Mutex::new(AdmissionCache::new(config.tag_cache_size)));

        let pool = if config.is_concurrent() {
            Some(Self::spawn_pool(
                config.clone(),
                manager.clone(),
                handle.clone(),
                tag_cache.clone(),
            ))
        } else {
            None
        };

        tracing::info!(
            schema = %config.connection.schema,
            max_conns = config.connection.max_conns,
            concurrent = config.is_concurrent(),
            "writer connected"
        );

        Ok(Self {
            config,
            manager,
            handle,
            tag_cache,
            pool,
            closed: AtomicBool::new(false),
        })
    }

    /// Write one batch, routing through the transactional or
    /// concurrent path depending on `connection.max_conns`.
    pub async fn write(&self, batch: &MetricBatch) -> Result<WriteReport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        match &self.pool {
            None => {
                Self::write_transactional(&self.config, &self.manager, &self.handle, &self.tag_cache, batch)
                    .await
            }
            Some(sender) => Self::write_concurrent(sender, batch).await,
        }
    }

    /// Stop accepting new batches, drain the worker pool with a 5s
    /// timeout, then drop the handle.
    pub async fn close(mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(sender) = self.pool.take() {
            // Every worker shares one receiver behind a mutex, so each
            // needs its own Shutdown message to wake up and exit; one
            // message would only reach whichever worker happened to
            // pull it, leaving the rest blocked on recv() forever.
            for _ in 0..self.config.connection.max_conns {
                let _ = sender.send(PoolMessage::Shutdown).await;
            }
            let deadline = sleep(Duration::from_secs(5));
            tokio::pin!(deadline);
            tokio::select! {
                _ = sender.closed() => {}
                _ = &mut deadline => {
                    tracing::warn!("writer close timed out waiting for workers to drain; abandoning in-flight work");
                }
            }
        }
        tracing::info!("writer closed");
        Ok(())
    }

    fn spawn_pool(
        config: Arc<Config>,
        manager: Arc<TableManager>,
        handle: Arc<dyn DbHandle>,
        tag_cache: Arc<Mutex<AdmissionCache>>,
    ) -> mpsc::Sender<PoolMessage> {
        let (tx, rx) = mpsc::channel(config.connection.max_conns * 4);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..config.connection.max_conns {
            let config = config.clone();
            let manager = manager.clone();
            let handle = handle.clone();
            let tag_cache = tag_cache.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let msg = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match msg {
                        Some(PoolMessage::Write(batch, reply)) => {
                            let report =
                                Self::write_with_retry(&config, &manager, &handle, &tag_cache, batch)
                                    .await;
                            let _ = reply.send(report);
                        }
                        Some(PoolMessage::Shutdown) | None => {
                            tracing::debug!(worker, "worker pool shutting down");
                            break;
                        }
                    }
                }
            });
        }

        tx
    }

    /// Split `batch` into one sub-batch per measurement and fan them
    /// out to the worker pool. There is no enclosing transaction: each
    /// sub-batch commits independently, and a sub-batch that fails
    /// permanently is dropped rather than failing its siblings.
    async fn write_concurrent(sender: &mpsc::Sender<PoolMessage>, batch: &MetricBatch) -> Result<WriteReport> {
        let mut receivers = Vec::new();
        for measurement in batch.measurements() {
            let records: Vec<Record> = batch.records_for(measurement).cloned().collect();
            let sub_batch = MetricBatch::new(records);
            let (tx, rx) = oneshot::channel();
            sender
                .send(PoolMessage::Write(sub_batch, tx))
                .await
                .map_err(|_| Error::ShuttingDown)?;
            receivers.push(rx);
        }

        let mut report = WriteReport::default();
        for rx in receivers {
            report.merge(rx.await.map_err(|_| Error::ShuttingDown)?);
        }
        Ok(report)
    }

    /// Exponential backoff starting at 250ms, doubling each attempt,
    /// capped at `retry_max_backoff`. A permanent failure is logged and
    /// the sub-batch is dropped rather than retried or propagated.
    async fn write_with_retry(
        config: &Config,
        manager: &TableManager,
        handle: &Arc<dyn DbHandle>,
        tag_cache: &Mutex<AdmissionCache>,
        batch: MetricBatch,
    ) -> WriteReport {
        let mut backoff = Duration::from_millis(250);
        let max = config.retry_max_backoff();
        loop {
            match Self::write_batch(config, manager, handle, tag_cache, &batch).await {
                Ok(report) => return report,
                Err(Error::Transient(message)) => {
                    tracing::warn!(%message, backoff_ms = backoff.as_millis(), "retrying sub-batch");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(max);
                }
                Err(other) => {
                    tracing::warn!(error = %other, "sub-batch failed permanently; dropping");
                    return WriteReport::default();
                }
            }
        }
    }

    /// Wrap the whole batch in one transaction, with each measurement
    /// writing inside its own savepoint so a single measurement's
    /// permanent failure rolls back only that savepoint and lets the
    /// rest of the batch commit.
    async fn write_transactional(
        config: &Config,
        manager: &TableManager,
        handle: &Arc<dyn DbHandle>,
        tag_cache: &Mutex<AdmissionCache>,
        batch: &MetricBatch,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        exec_or_err(handle, "BEGIN").await?;

        for (idx, measurement) in batch.measurements().into_iter().enumerate() {
            let savepoint = format!("pgmetrics_sp_{idx}");
            exec_or_err(handle, &format!("SAVEPOINT {savepoint}")).await?;

            match Self::write_measurement(config, manager, handle, tag_cache, batch, measurement).await {
                Ok(measurement_report) => {
                    exec_or_err(handle, &format!("RELEASE SAVEPOINT {savepoint}")).await?;
                    report.merge(measurement_report);
                }
                Err(err @ Error::Transient(_)) => {
                    // A temporary failure taints the whole transaction: abort
                    // and propagate so the caller retries the entire batch,
                    // rather than committing a partial result.
                    tracing::warn!(measurement, error = %err, "temporary failure; aborting the whole batch");
                    let _ = handle.exec("ROLLBACK").await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(measurement, error = %err, "measurement failed; rolling back its savepoint");
                    let _ = handle.exec(&format!("ROLLBACK TO SAVEPOINT {savepoint}")).await;
                }
            }
        }

        exec_or_err(handle, "COMMIT").await?;
        Ok(report)
    }

    /// Write every measurement in `batch` with no enclosing
    /// transaction, used by the concurrent path's per-measurement
    /// sub-batches (each already scoped to one measurement, but this
    /// stays general so retries can reuse it unchanged).
    async fn write_batch(
        config: &Config,
        manager: &TableManager,
        handle: &Arc<dyn DbHandle>,
        tag_cache: &Mutex<AdmissionCache>,
        batch: &MetricBatch,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        for measurement in batch.measurements() {
            let measurement_report =
                Self::write_measurement(config, manager, handle, tag_cache, batch, measurement).await?;
            report.merge(measurement_report);
        }
        Ok(report)
    }

    async fn write_measurement(
        config: &Config,
        manager: &TableManager,
        handle: &Arc<dyn DbHandle>,
        tag_cache: &Mutex<AdmissionCache>,
        batch: &MetricBatch,
        measurement: &str,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();

        let tag_table = if config.tags_as_foreign_keys {
            Some(format!("{measurement}{}", config.tag_table_suffix))
        } else {
            None
        };

        if let Some(tag_table) = &tag_table {
            let mut cache = tag_cache.lock().await;
            let mut tag_source = TagTableSource::build(
                batch,
                measurement,
                tag_table.clone(),
                &mut cache,
                config.tags_as_jsonb,
            );
            drop(cache);

            if !tag_source.is_empty() {
                let diff = manager.match_source(&tag_source).await;
                let (_, dropped) = manager
                    .ensure_structure(tag_table, true, measurement, Some(tag_table), &tag_source, &diff)
                    .await?;
                if !dropped.is_empty() {
                    report.dropped_columns.insert(tag_table.clone(), dropped.clone());
                }

                let written = Self::merge_tag_rows(handle, &config.connection.schema, tag_table, &mut tag_source, &dropped)
                    .await
                    .map_err(|(severity, message)| match severity {
                        Severity::Temporary => Error::Transient(message),
                        Severity::Permanent => Error::TagInsertFailed {
                            table: tag_table.clone(),
                            message,
                        },
                    })?;
                report.tag_rows_written += written;

                let mut cache = tag_cache.lock().await;
                tag_source.update_cache(&mut cache);
            }
        }

        let mut source = MetricTableSource::build(
            batch,
            measurement,
            config.use_uint8,
            config.tags_as_foreign_keys,
            config.tags_as_jsonb,
            config.fields_as_jsonb,
        );
        if source.is_empty() {
            return Ok(report);
        }

        let diff = manager.match_source(&source).await;
        let (_, dropped) = manager
            .ensure_structure(measurement, false, measurement, tag_table.as_deref(), &source, &diff)
            .await?;
        if !dropped.is_empty() {
            report
                .dropped_columns
                .entry(measurement.to_string())
                .or_default()
                .extend(dropped.clone());
        }

        let written = Self::copy_all(handle, &mut source, measurement, &dropped)
            .await
            .map_err(|(severity, message)| match severity {
                Severity::Temporary => Error::Transient(message),
                Severity::Permanent => Error::CopyFailed {
                    table: measurement.to_string(),
                    message,
                },
            })?;
        report.rows_written += written;

        Ok(report)
    }

    /// Stage the tag source's rows into a fresh temp table, then merge
    /// them into the real tag table with `INSERT ... ON CONFLICT
    /// (tag_id) DO NOTHING`, so concurrent workers race safely on
    /// identical tag rows instead of failing a unique-violation.
    async fn merge_tag_rows(
        handle: &Arc<dyn DbHandle>,
        schema: &str,
        tag_table: &str,
        tag_source: &mut TagTableSource,
        dropped: &[String],
    ) -> std::result::Result<u64, (Severity, String)> {
        let n = TEMP_TABLE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_table = format!("{tag_table}_stage_{n}");
        let temp_table_ident = quote_ident(&temp_table);

        let columns_ddl: String = tag_source
            .columns()
            .iter()
            .filter(|c| !dropped.contains(&c.name))
            .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type.ddl()))
            .collect::<Vec<_>>()
            .join(", ");
        let create = format!("CREATE TEMP TABLE {temp_table_ident} ({columns_ddl})");
        handle
            .exec(&create)
            .await
            .map_err(|e| (classify(e.as_ref()), e.to_string()))?;

        let written = Self::copy_all(handle, tag_source, &temp_table, dropped).await?;

        if written > 0 {
            let merge = format!(
                "INSERT INTO {} SELECT * FROM {temp_table_ident} ORDER BY tag_id ON CONFLICT (tag_id) DO NOTHING",
                qualify(schema, tag_table)
            );
            handle
                .exec(&merge)
                .await
                .map_err(|e| (classify(e.as_ref()), e.to_string()))?;
        }

        let _ = handle.exec(&format!("DROP TABLE {temp_table_ident}")).await;
        Ok(written)
    }

    /// Drive a [`TableSource`] to completion and bulk-copy its rows,
    /// excluding any column the table manager could not reconcile
    /// (`dropped`) from both the column list and every row's values.
    async fn copy_all(
        handle: &Arc<dyn DbHandle>,
        source: &mut dyn TableSource,
        table: &str,
        dropped: &[String],
    ) -> std::result::Result<u64, (Severity, String)> {
        let keep: Vec<usize> = source
            .column_names()
            .iter()
            .enumerate()
            .filter(|(_, name)| !dropped.contains(name))
            .map(|(idx, _)| idx)
            .collect();
        let column_names: Vec<String> = keep
            .iter()
            .map(|&idx| source.column_names()[idx].clone())
            .collect();

        let mut rows: Vec<Vec<SqlValue>> = Vec::new();
        while source.next() {
            let full = source.values();
            rows.push(keep.iter().map(|&idx| full[idx].clone()).collect());
        }
        if rows.is_empty() {
            return Ok(0);
        }

        match handle.copy_from(table, &column_names, &rows).await {
            Ok(count) => Ok(count),
            Err(db_err) => Err((classify(db_err.as_ref()), db_err.to_string())),
        }
    }
}

async fn exec_or_err(handle: &Arc<dyn DbHandle>, sql: &str) -> Result<()> {
    handle.exec(sql).await.map(|_| ()).map_err(|db_err| match classify(db_err.as_ref()) {
        Severity::Temporary => Error::Transient(db_err.to_string()),
        Severity::Permanent => Error::Permanent(db_err.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockHandle;
    use crate::metric::FieldValue;
    use crate::template::TemplateSet;
    use chrono::Utc;

    fn config(max_conns: usize) -> Config {
        let toml = format!(
            r#"
[connection]
dsn = "postgres://localhost/metrics"
max_conns = {max_conns}
"#
        );
        let mut config: Config = toml::from_str(&toml).unwrap();
        config.create_templates = TemplateSet(vec!["CREATE TABLE {table} ({columns})".to_string()]);
        config.add_column_templates = TemplateSet(vec![
            "ALTER TABLE {table} ADD COLUMN {column} {sql_type}".to_string(),
        ]);
        config.tag_table_create_templates = config.create_templates.clone();
        config.tag_table_add_column_templates = config.add_column_templates.clone();
        config
    }

    fn record(measurement: &str, tags: &[(&str, &str)], fields: &[(&str, FieldValue)]) -> Record {
        Record {
            measurement: measurement.to_string(),
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn writes_create_table_and_copy_rows_transactionally() {
        let handle: Arc<dyn DbHandle> = Arc::new(MockHandle::new());
        let writer = Writer::connect(handle.clone(), config(1)).await.unwrap();
        let batch = MetricBatch::new(vec![record(
            "cpu",
            &[("host", "a")],
            &[("usage", FieldValue::F64(42.0))],
        )]);
        let report = writer.write(&batch).await.unwrap();
        assert_eq!(report.rows_written, 1);
        assert!(report.dropped_columns.is_empty());
    }

    #[tokio::test]
    async fn tags_as_foreign_keys_merges_via_temp_table() {
        let handle = Arc::new(MockHandle::new());
        let dyn_handle: Arc<dyn DbHandle> = handle.clone();
        let mut cfg = config(1);
        cfg.tags_as_foreign_keys = true;
        let writer = Writer::connect(dyn_handle, cfg).await.unwrap();

        let batch = MetricBatch::new(vec![
            record("cpu", &[("host", "a")], &[("usage", FieldValue::F64(1.0))]),
            record("cpu", &[("host", "b")], &[("usage", FieldValue::F64(2.0))]),
        ]);
        let report = writer.write(&batch).await.unwrap();
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.tag_rows_written, 2);
        assert_eq!(handle.rows_in("cpu_tag").len(), 2);

        // a repeat of the same tagset doesn't grow the tag table further
        let again = MetricBatch::new(vec![record(
            "cpu",
            &[("host", "a")],
            &[("usage", FieldValue::F64(3.0))],
        )]);
        let report2 = writer.write(&again).await.unwrap();
        assert_eq!(report2.tag_rows_written, 0);
        assert_eq!(handle.rows_in("cpu_tag").len(), 2);
    }

    #[tokio::test]
    async fn concurrent_path_splits_per_measurement_and_merges_reports() {
        let handle: Arc<dyn DbHandle> = Arc::new(MockHandle::new());
        let writer = Writer::connect(handle.clone(), config(3)).await.unwrap();

        let batch = MetricBatch::new(vec![
            record("cpu", &[], &[("usage", FieldValue::F64(1.0))]),
            record("disk", &[], &[("free", FieldValue::F64(2.0))]),
            record("mem", &[], &[("used", FieldValue::F64(3.0))]),
        ]);
        let report = writer.write(&batch).await.unwrap();
        assert_eq!(report.rows_written, 3);

        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_rejects_further_writes() {
        let handle: Arc<dyn DbHandle> = Arc::new(MockHandle::new());
        let writer = Writer::connect(handle.clone(), config(2)).await.unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn a_failing_measurement_does_not_block_the_rest_of_the_batch() {
        use crate::db::mock::MockDbError;

        let handle = Arc::new(MockHandle::new());
        let dyn_handle: Arc<dyn DbHandle> = handle.clone();
        let writer = Writer::connect(dyn_handle, config(1)).await.unwrap();

        handle.fail_always_on(
            "CREATE TABLE \"public\".\"disk\"",
            MockDbError::new("42601", "bad template"),
        );

        let batch = MetricBatch::new(vec![
            record("cpu", &[], &[("usage", FieldValue::F64(1.0))]),
            record("disk", &[], &[("free", FieldValue::F64(2.0))]),
        ]);
        let report = writer.write(&batch).await.unwrap();

        // cpu's savepoint commits even though disk's permanently failed
        assert_eq!(report.rows_written, 1);
        assert!(handle.columns_of("cpu").is_some());
        assert!(handle.columns_of("disk").is_none());
    }

    #[tokio::test]
    async fn a_temporary_failure_aborts_and_propagates_instead_of_committing() {
        use crate::db::mock::MockDbError;

        let handle = Arc::new(MockHandle::new());
        let dyn_handle: Arc<dyn DbHandle> = handle.clone();
        let mut cfg = config(1);
        cfg.tags_as_foreign_keys = true;
        let writer = Writer::connect(dyn_handle, cfg).await.unwrap();

        // class 53 (insufficient resources) classifies as temporary.
        handle.fail_always_on(
            "CREATE TEMP TABLE",
            MockDbError::new("53300", "too_many_connections"),
        );

        let batch = MetricBatch::new(vec![record(
            "cpu",
            &[("host", "a")],
            &[("usage", FieldValue::F64(1.0))],
        )]);
        let err = writer.write(&batch).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
    }
}
