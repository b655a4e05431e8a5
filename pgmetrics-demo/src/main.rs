//! pgmetrics-demo
//!
//! Drives `pgmetrics-core` end to end against `MockHandle`, generating
//! a synthetic batch of cpu/disk measurements and printing the
//! resulting write report. Useful for exercising a config file's
//! templates without a real Postgres instance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use pgmetrics_core::db::mock::MockHandle;
use pgmetrics_core::db::DbHandle;
use pgmetrics_core::{Config, FieldValue, MetricBatch, Record, Writer};

#[derive(Parser, Debug)]
#[command(name = "pgmetrics-demo")]
#[command(about = "Drive pgmetrics-core against an in-memory mock handle")]
#[command(version)]
struct Args {
    /// Path to a TOML config file. Defaults to the sample shipped with
    /// pgmetrics-core.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of synthetic batches to write.
    #[arg(long, default_value_t = 3)]
    batches: u32,

    /// Distinct hosts to spread synthetic tags across.
    #[arg(long, default_value_t = 4)]
    hosts: u32,
}

fn synthetic_batch(batch_index: u32, hosts: u32) -> MetricBatch {
    let mut records = Vec::new();
    for host_index in 0..hosts {
        let host = format!("server-{host_index}");
        records.push(Record {
            measurement: "cpu".to_string(),
            tags: [("host".to_string(), host.clone())].into(),
            fields: [
                ("usage_idle".to_string(), FieldValue::F64(90.0 - batch_index as f64)),
                ("usage_user".to_string(), FieldValue::F64(5.0 + batch_index as f64)),
            ]
            .into(),
            timestamp: Utc::now(),
        });
        records.push(Record {
            measurement: "disk".to_string(),
            tags: [("host".to_string(), host), ("path".to_string(), "/".to_string())].into(),
            fields: [("free_bytes".to_string(), FieldValue::U64(100_000_000 + batch_index as u64))].into(),
            timestamp: Utc::now(),
        });
    }
    MetricBatch::new(records)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../pgmetrics-core/config.sample.toml"));
    let config = Config::load_from(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    pgmetrics_core::logging::init(&config.logging);

    let mock_handle = Arc::new(MockHandle::new());
    let handle: Arc<dyn DbHandle> = mock_handle.clone();
    let writer = Writer::connect(handle, config).await?;

    for batch_index in 0..args.batches {
        let batch = synthetic_batch(batch_index, args.hosts);
        let report = writer.write(&batch).await?;
        println!(
            "batch {batch_index}: wrote {} rows ({} tag rows), dropped columns: {:?}",
            report.rows_written, report.tag_rows_written, report.dropped_columns
        );
    }

    writer.close().await?;

    for table in ["cpu", "disk", "cpu_tag", "disk_tag"] {
        if let Some(columns) = mock_handle.columns_of(table) {
            println!(
                "{table}: {} columns, {} rows",
                columns.len(),
                mock_handle.rows_in(table).len()
            );
        }
    }

    Ok(())
}
