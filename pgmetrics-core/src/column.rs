//! Column model and type inference.
//!
//! A table's shape is a list of [`Column`]s. Inference maps a field's
//! native Rust width to its narrowest safe SQL type; reconciling two
//! columns of the same name only ever widens, never narrows, matching
//! the no-downgrade rule for schema evolution.

use crate::error::{Error, Result};
use crate::metric::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    SmallInt,
    Int,
    BigInt,
    Real,
    DoublePrecision,
    /// Unsigned 64-bit values with no lossless signed home; the default
    /// landing type absent `use_uint8`.
    Numeric,
    /// The registered `uint8` extension type `use_uint8` asks for in
    /// place of `Numeric`.
    Uint8Extension,
    /// A single column coalescing an entire tag- or field-set, used
    /// when `tags_as_jsonb`/`fields_as_jsonb` is set.
    Json,
    Text,
    TimestampTz,
}

impl SqlType {
    pub fn from_ddl(ddl: &str) -> Option<Self> {
        match ddl.trim().to_uppercase().as_str() {
            "BOOLEAN" => Some(SqlType::Boolean),
            "SMALLINT" => Some(SqlType::SmallInt),
            "INTEGER" | "INT" => Some(SqlType::Int),
            "BIGINT" => Some(SqlType::BigInt),
            "REAL" => Some(SqlType::Real),
            "DOUBLE PRECISION" => Some(SqlType::DoublePrecision),
            "NUMERIC" => Some(SqlType::Numeric),
            "UINT8" => Some(SqlType::Uint8Extension),
            "JSONB" => Some(SqlType::Json),
            "TEXT" => Some(SqlType::Text),
            "TIMESTAMPTZ" => Some(SqlType::TimestampTz),
            _ => None,
        }
    }

    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Int => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::DoublePrecision => "DOUBLE PRECISION",
            SqlType::Numeric => "NUMERIC",
            SqlType::Uint8Extension => "uint8",
            SqlType::Json => "JSONB",
            SqlType::Text => "TEXT",
            SqlType::TimestampTz => "TIMESTAMPTZ",
        }
    }

    /// Widening rank within a compatible family. Columns in different
    /// families never widen into each other. `Numeric`/`Uint8Extension`/
    /// `Json` have no wider sibling; two columns of the same one of
    /// those types are only ever identical, never widened.
    fn rank(&self) -> Option<(u8, u8)> {
        match self {
            SqlType::SmallInt => Some((0, 0)),
            SqlType::Int => Some((0, 1)),
            SqlType::BigInt => Some((0, 2)),
            SqlType::Real => Some((1, 0)),
            SqlType::DoublePrecision => Some((1, 1)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Time,
    Tag,
    TagId,
    Field,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub role: ColumnRole,
    pub sql_type: SqlType,
}

pub fn time_column() -> Column {
    Column {
        name: "time".to_string(),
        role: ColumnRole::Time,
        sql_type: SqlType::TimestampTz,
    }
}

pub fn tag_id_column() -> Column {
    Column {
        name: "tag_id".to_string(),
        role: ColumnRole::TagId,
        sql_type: SqlType::BigInt,
    }
}

pub fn column_from_tag(name: &str) -> Column {
    Column {
        name: name.to_string(),
        role: ColumnRole::Tag,
        sql_type: SqlType::Text,
    }
}

pub fn column_from_field(name: &str, value: &FieldValue, use_uint8: bool) -> Column {
    let sql_type = match value {
        FieldValue::Bool(_) => SqlType::Boolean,
        FieldValue::I8(_) => SqlType::SmallInt,
        FieldValue::I16(_) => SqlType::SmallInt,
        FieldValue::I32(_) => SqlType::Int,
        FieldValue::I64(_) => SqlType::BigInt,
        FieldValue::U8(_) => SqlType::Int,
        FieldValue::U16(_) => SqlType::Int,
        FieldValue::U32(_) => SqlType::BigInt,
        // u64 has no lossless signed home: NUMERIC by default, or the
        // registered `uint8` extension type when use_uint8 is set.
        FieldValue::U64(_) if use_uint8 => SqlType::Uint8Extension,
        FieldValue::U64(_) => SqlType::Numeric,
        FieldValue::F32(_) => SqlType::Real,
        FieldValue::F64(_) => SqlType::DoublePrecision,
        FieldValue::Str(_) => SqlType::Text,
    };
    Column {
        name: name.to_string(),
        role: ColumnRole::Field,
        sql_type,
    }
}

pub fn coalesce_columns(existing: &Column, incoming: &Column) -> Result<Column> {
    if existing.sql_type == incoming.sql_type {
        return Ok(existing.clone());
    }
    match (existing.sql_type.rank(), incoming.sql_type.rank()) {
        (Some((fam_a, rank_a)), Some((fam_b, rank_b))) if fam_a == fam_b => {
            let widest = if rank_a >= rank_b { existing } else { incoming };
            Ok(widest.clone())
        }
        _ => Err(Error::ColumnConflict {
            table: String::new(),
            column: existing.name.clone(),
            existing: format!("{:?}", existing.sql_type),
            incoming: format!("{:?}", incoming.sql_type),
        }),
    }
}
