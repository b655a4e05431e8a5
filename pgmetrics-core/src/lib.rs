//! # pgmetrics-core
//!
//! Core library for a Postgres metrics output adapter: given a batch of
//! time-series records, reconcile each measurement's table against the
//! live catalog, widen columns where it's safe, optionally normalize
//! tags into a separate table, and bulk-copy the rows.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pgmetrics_core::{Config, Writer};
//! use pgmetrics_core::db::mock::MockHandle;
//!
//! # async fn run() -> pgmetrics_core::Result<()> {
//! let config = Config::load_from("config.sample.toml".as_ref())?;
//! let handle: Arc<dyn pgmetrics_core::db::DbHandle> = Arc::new(MockHandle::new());
//! let writer = Writer::connect(handle, config).await?;
//! // writer.write(&batch).await?;
//! writer.close().await?;
//! # Ok(())
//! # }
//! ```

pub use config::Config;
pub use error::{Error, Result};
pub use metric::{FieldValue, MetricBatch, Record};
pub use writer::{WriteReport, Writer};

pub mod cache;
pub mod classify;
pub mod column;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod manager;
pub mod metric;
pub mod source;
pub mod tag;
pub mod tag_source;
pub mod template;
pub mod writer;
