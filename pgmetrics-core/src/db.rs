//! Abstract database handle.
//!
//! The wire driver is out of scope for this crate: `DbHandle` is the
//! seam a real `tokio-postgres`/`sqlx` adapter would implement. Tests
//! and the demo binary exercise the core against [`mock::MockHandle`],
//! an in-memory stand-in that models a catalog and rows without
//! pulling in any driver crate.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::column::{Column, SqlType};

/// A value ready to bind into a statement or a copy row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    DoublePrecision(f64),
    Text(String),
    TimestampTz(DateTime<Utc>),
    /// A NUMERIC or registered-extension-type value, carried as its
    /// decimal text so a u64 above `i64::MAX` never truncates.
    Numeric(String),
    /// A coalesced tag- or field-set, already serialized to JSON text.
    Json(String),
}

impl SqlValue {
    /// Convert a field's native value into the shape a column of
    /// `sql_type` expects, per the widening rules column inference
    /// already applied when choosing that type.
    pub fn from_field(value: &crate::metric::FieldValue, sql_type: SqlType) -> Self {
        use crate::metric::FieldValue as F;
        match (value, sql_type) {
            (F::Bool(v), SqlType::Boolean) => SqlValue::Bool(*v),
            (F::I8(v), SqlType::SmallInt) => SqlValue::SmallInt(*v as i16),
            (F::I16(v), SqlType::SmallInt) => SqlValue::SmallInt(*v),
            (F::I16(v), SqlType::Int) => SqlValue::Int(*v as i32),
            (F::I16(v), SqlType::BigInt) => SqlValue::BigInt(*v as i64),
            (F::I32(v), SqlType::Int) => SqlValue::Int(*v),
            (F::I32(v), SqlType::BigInt) => SqlValue::BigInt(*v as i64),
            (F::I64(v), SqlType::BigInt) => SqlValue::BigInt(*v),
            (F::U8(v), SqlType::SmallInt) => SqlValue::SmallInt(*v as i16),
            (F::U8(v), SqlType::Int) => SqlValue::Int(*v as i32),
            (F::U8(v), SqlType::BigInt) => SqlValue::BigInt(*v as i64),
            (F::U16(v), SqlType::Int) => SqlValue::Int(*v as i32),
            (F::U16(v), SqlType::BigInt) => SqlValue::BigInt(*v as i64),
            (F::U32(v), SqlType::BigInt) => SqlValue::BigInt(*v as i64),
            // Both the default NUMERIC landing type and the registered
            // uint8 extension type bind from the value's decimal text,
            // so no u64 value ever truncates.
            (F::U64(v), SqlType::Numeric) => SqlValue::Numeric(v.to_string()),
            (F::U64(v), SqlType::Uint8Extension) => SqlValue::Numeric(v.to_string()),
            (F::F32(v), SqlType::Real) => SqlValue::Real(*v),
            (F::F32(v), SqlType::DoublePrecision) => SqlValue::DoublePrecision(*v as f64),
            (F::F64(v), SqlType::DoublePrecision) => SqlValue::DoublePrecision(*v),
            (F::Str(v), SqlType::Text) => SqlValue::Text(v.clone()),
            _ => SqlValue::Null,
        }
    }
}

/// Everything the error classifier (C7) needs from a driver error,
/// without depending on the driver's own error type.
pub trait DbError: fmt::Display + fmt::Debug + Send + Sync {
    /// The five-character SQLSTATE code, if the driver surfaces one.
    fn sqlstate(&self) -> Option<&str>;

    /// The name of the violated constraint or index, when applicable
    /// (used to distinguish the specific unique_violation the
    /// classifier treats as temporary from any other).
    fn constraint_name(&self) -> Option<&str> {
        None
    }

    /// True when the driver itself flags the error as transient,
    /// independent of SQLSTATE (e.g. a connection reset).
    fn is_driver_temporary(&self) -> bool {
        false
    }
}

pub type DbResult<T> = std::result::Result<T, Box<dyn DbError>>;

#[async_trait]
pub trait Transaction: Send {
    async fn exec(&mut self, sql: &str) -> DbResult<u64>;
    async fn commit(self: Box<Self>) -> DbResult<()>;
    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

#[async_trait]
pub trait DbHandle: Send + Sync {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>>;

    async fn exec(&self, sql: &str) -> DbResult<u64>;

    /// The live column set for `schema.table`, or `None` if the table
    /// does not exist.
    async fn query_columns(&self, schema: &str, table: &str) -> DbResult<Option<Vec<Column>>>;

    /// Bulk-load `rows` into `table`'s `columns`, in the spirit of
    /// Postgres `COPY`.
    async fn copy_from(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> DbResult<u64>;
}

pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{DbError, DbHandle, DbResult, SqlValue, Transaction};
    use crate::column::Column;

    #[derive(Debug, Clone)]
    pub struct MockDbError {
        pub sqlstate: Option<String>,
        pub constraint_name: Option<String>,
        pub message: String,
        pub driver_temporary: bool,
    }

    impl MockDbError {
        pub fn new(sqlstate: &str, message: impl Into<String>) -> Self {
            Self {
                sqlstate: Some(sqlstate.to_string()),
                constraint_name: None,
                message: message.into(),
                driver_temporary: false,
            }
        }

        pub fn with_constraint(mut self, name: &str) -> Self {
            self.constraint_name = Some(name.to_string());
            self
        }
    }

    impl std::fmt::Display for MockDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl DbError for MockDbError {
        fn sqlstate(&self) -> Option<&str> {
            self.sqlstate.as_deref()
        }

        fn constraint_name(&self) -> Option<&str> {
            self.constraint_name.as_deref()
        }

        fn is_driver_temporary(&self) -> bool {
            self.driver_temporary
        }
    }

    /// One scripted failure: an `exec` whose SQL contains `matching`
    /// fails with `error`. A one-shot failure is consumed after firing
    /// once; a repeating failure (`repeats = true`) fires for every
    /// matching statement, for scenarios where a condition never clears.
    struct ScriptedFailure {
        matching: String,
        error: MockDbError,
        repeats: bool,
    }

    #[derive(Default)]
    struct Inner {
        catalog: HashMap<String, Vec<Column>>,
        rows: HashMap<String, Vec<Vec<SqlValue>>>,
        scripted: Vec<ScriptedFailure>,
    }

    /// An in-memory stand-in for a Postgres connection, used by this
    /// crate's own tests and by `pgmetrics-demo`.
    #[derive(Default)]
    pub struct MockHandle {
        inner: Mutex<Inner>,
    }

    impl MockHandle {
        pub fn new() -> Self {
            Self::default()
        }

        /// Arrange for the next `exec` containing `matching` to fail once
        /// with `error`.
        pub fn fail_once_on(&self, matching: &str, error: MockDbError) {
            let mut inner = self.inner.lock().unwrap();
            inner.scripted.push(ScriptedFailure {
                matching: matching.to_string(),
                error,
                repeats: false,
            });
        }

        /// Arrange for every `exec` containing `matching` to fail with
        /// `error`, indefinitely (used to exercise the
        /// drop-on-permanent-failure path, where retrying never helps).
        pub fn fail_always_on(&self, matching: &str, error: MockDbError) {
            let mut inner = self.inner.lock().unwrap();
            inner.scripted.push(ScriptedFailure {
                matching: matching.to_string(),
                error,
                repeats: true,
            });
        }

        pub fn rows_in(&self, table: &str) -> Vec<Vec<SqlValue>> {
            self.inner
                .lock()
                .unwrap()
                .rows
                .get(table)
                .cloned()
                .unwrap_or_default()
        }

        pub fn columns_of(&self, table: &str) -> Option<Vec<Column>> {
            self.inner.lock().unwrap().catalog.get(table).cloned()
        }

        fn take_failure(inner: &mut Inner, sql: &str) -> Option<MockDbError> {
            let idx = inner
                .scripted
                .iter()
                .position(|f| sql.contains(&f.matching))?;
            let scripted = if inner.scripted[idx].repeats {
                inner.scripted[idx].error.clone()
            } else {
                inner.scripted.remove(idx).error
            };
            Some(scripted)
        }

        fn apply_ddl(inner: &mut Inner, sql: &str) {
            let upper = sql.to_uppercase();
            if let Some(table) = parse_create_table(sql) {
                inner.catalog.entry(table).or_default();
            } else if upper.starts_with("ALTER TABLE") {
                if let Some((table, column)) = parse_add_column(sql) {
                    inner.catalog.entry(table).or_default().push(column);
                }
            } else if let Some((dest, src)) = parse_insert_select(sql) {
                let on_conflict_do_nothing =
                    upper.contains("ON CONFLICT") && upper.contains("DO NOTHING");
                let staged = inner.rows.get(&src).cloned().unwrap_or_default();
                let dest_rows = inner.rows.entry(dest).or_default();
                for row in staged {
                    if on_conflict_do_nothing {
                        let key = row.first().cloned();
                        if dest_rows.iter().any(|existing| existing.first() == key.as_ref()) {
                            continue;
                        }
                    }
                    dest_rows.push(row);
                }
            }
        }
    }

    /// The mock doesn't model schemas, only table names; a
    /// `"schema"."table"` identifier is reduced to its last segment, with
    /// surrounding quotes stripped and doubled embedded quotes unescaped.
    fn unqualify(name: &str) -> String {
        let last = name.rsplit('.').next().unwrap_or(name).trim();
        if last.len() >= 2 && last.starts_with('"') && last.ends_with('"') {
            last[1..last.len() - 1].replace("\"\"", "\"")
        } else {
            last.to_string()
        }
    }

    fn parse_create_table(sql: &str) -> Option<String> {
        let upper = sql.to_uppercase();
        if !upper.starts_with("CREATE TABLE") {
            return None;
        }
        sql.split_whitespace()
            .nth(2)
            .map(|s| unqualify(s.trim_end_matches('(')))
    }

    /// Recognizes the `INSERT INTO <dest> SELECT * FROM <src> ...`
    /// shape the tag-table merge renders, and simulates moving rows
    /// from `src` into `dest`, respecting `ON CONFLICT ... DO NOTHING`.
    /// Real SQL semantics otherwise are out of scope for this mock.
    fn parse_insert_select(sql: &str) -> Option<(String, String)> {
        let upper = sql.to_uppercase();
        if !upper.starts_with("INSERT INTO") {
            return None;
        }
        let words: Vec<&str> = sql.split_whitespace().collect();
        let dest = unqualify(words.get(2)?);
        let from_idx = words.iter().position(|w| w.eq_ignore_ascii_case("FROM"))?;
        let src = unqualify(words.get(from_idx + 1)?);
        Some((dest, src))
    }

    fn parse_add_column(sql: &str) -> Option<(String, Column)> {
        // "ALTER TABLE <table> ADD COLUMN <name> <type>"
        let words: Vec<&str> = sql.split_whitespace().collect();
        let table = unqualify(words.get(2)?);
        let name = unqualify(words.get(5)?);
        let sql_type_str = words.get(6..)?.join(" ");
        let sql_type = crate::column::SqlType::from_ddl(&sql_type_str)?;
        Some((
            table,
            Column {
                name,
                role: crate::column::ColumnRole::Field,
                sql_type,
            },
        ))
    }

    #[async_trait]
    impl DbHandle for MockHandle {
        async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
            Ok(Box::new(MockTransaction { handle: self }))
        }

        async fn exec(&self, sql: &str) -> DbResult<u64> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(err) = Self::take_failure(&mut inner, sql) {
                return Err(Box::new(err));
            }
            Self::apply_ddl(&mut inner, sql);
            Ok(1)
        }

        async fn query_columns(&self, _schema: &str, table: &str) -> DbResult<Option<Vec<Column>>> {
            Ok(self.inner.lock().unwrap().catalog.get(table).cloned())
        }

        async fn copy_from(
            &self,
            table: &str,
            _columns: &[String],
            rows: &[Vec<SqlValue>],
        ) -> DbResult<u64> {
            let mut inner = self.inner.lock().unwrap();
            let count = rows.len() as u64;
            inner
                .rows
                .entry(table.to_string())
                .or_default()
                .extend(rows.iter().cloned());
            Ok(count)
        }
    }

    /// The mock has no real atomicity: statements apply immediately, and
    /// rollback simply does nothing, since none of the scripted failure
    /// scenarios in this crate's tests depend on undoing partial DDL.
    struct MockTransaction<'a> {
        handle: &'a MockHandle,
    }

    #[async_trait]
    impl<'a> Transaction for MockTransaction<'a> {
        async fn exec(&mut self, sql: &str) -> DbResult<u64> {
            self.handle.exec(sql).await
        }

        async fn commit(self: Box<Self>) -> DbResult<()> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> DbResult<()> {
            Ok(())
        }
    }

}
