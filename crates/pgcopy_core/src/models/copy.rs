//! Table copy models: row values, reconciled schema, requests and outcomes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Default number of rows per applied chunk.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default destination schema.
pub const DEFAULT_SCHEMA: &str = "public";

/// Default destination port.
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Default destination user.
pub const DEFAULT_PG_USER: &str = "postgres";

// ============================================================================
// Row values
// ============================================================================

/// A single non-null, non-composite value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// A source cell, classified once when the row is fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Scalar(ScalarValue),
    /// Array column values, element by element.
    Sequence(Vec<CellValue>),
    /// json/jsonb values.
    Structured(serde_json::Value),
    /// bytea values.
    Binary(Vec<u8>),
}

impl CellValue {
    /// Text scalar shorthand.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Scalar(ScalarValue::Text(value.into()))
    }

    /// Integer scalar shorthand.
    pub fn int(value: i64) -> Self {
        Self::Scalar(ScalarValue::Int(value))
    }

    /// JSON view of the value, used when the destination column is JSON-typed
    /// or the value is itself composite.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Scalar(ScalarValue::Bool(b)) => Value::Bool(*b),
            Self::Scalar(ScalarValue::Int(i)) => Value::from(*i),
            Self::Scalar(ScalarValue::Float(f)) => {
                serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
            }
            Self::Scalar(ScalarValue::Text(s)) => Value::String(s.clone()),
            Self::Sequence(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Structured(value) => value.clone(),
            Self::Binary(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

// ============================================================================
// Reconciled schema
// ============================================================================

/// Destination column type text exactly as the catalog formats it
/// (e.g. `integer`, `text[]`, `timestamp with time zone`).
///
/// Only catalog lookups inside this crate can construct one; the text is
/// spliced into SQL unescaped as a cast target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeclaredType(String);

impl DeclaredType {
    pub(crate) fn from_catalog(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The raw type text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the type is an array type.
    pub fn is_array(&self) -> bool {
        self.0.contains("[]")
    }

    /// Whether the type is `json` or `jsonb`.
    pub fn is_json(&self) -> bool {
        self.0.eq_ignore_ascii_case("json") || self.0.eq_ignore_ascii_case("jsonb")
    }

    /// Whether the type is `bytea`.
    pub fn is_bytea(&self) -> bool {
        self.0.eq_ignore_ascii_case("bytea")
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One destination column as reported by the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteColumn {
    pub name: String,
    pub declared_type: DeclaredType,
}

impl RemoteColumn {
    pub(crate) fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self { name: name.into(), declared_type: DeclaredType::from_catalog(declared_type) }
    }
}

/// Columns present on both sides, in destination ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSet(Vec<String>);

impl ColumnSet {
    pub(crate) fn new(columns: Vec<String>) -> Self {
        Self(columns)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Destination column name to declared type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationTypeMap(HashMap<String, DeclaredType>);

impl DestinationTypeMap {
    pub(crate) fn from_columns(columns: &[RemoteColumn]) -> Self {
        Self(columns.iter().map(|c| (c.name.clone(), c.declared_type.clone())).collect())
    }

    pub fn get(&self, column: &str) -> Option<&DeclaredType> {
        self.0.get(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// ColumnSet and DestinationTypeMap taken from one schema snapshot.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub columns: ColumnSet,
    pub types: DestinationTypeMap,
}

impl Reconciliation {
    /// Declared types in ColumnSet order.
    ///
    /// Every ColumnSet entry is drawn from the same remote column list as the
    /// type map, so each lookup succeeds.
    pub fn ordered_types(&self) -> Vec<&DeclaredType> {
        self.columns.iter().filter_map(|c| self.types.get(c)).collect()
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A destination registered on the source as a foreign server.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteServer {
    /// Foreign server name used by dblink
    pub name: String,
    /// Destination hostname, as seen from the source database
    pub host: String,
    /// Destination port
    pub port: u16,
    /// Destination database
    pub database: String,
    /// Destination login
    pub username: String,
    /// Destination password
    pub password: String,
}

impl fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServer")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters for one table copy.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub server: RemoteServer,
    pub source_schema: String,
    pub source_table: String,
    pub dest_schema: String,
    pub dest_table: String,
    pub batch_size: usize,
    pub row_limit: Option<u64>,
}

impl CopyRequest {
    /// Copy `schema.table` on the source to the same table name on `server`.
    pub fn new(
        server: RemoteServer,
        source_schema: impl Into<String>,
        table: impl Into<String>,
        dest_schema: impl Into<String>,
    ) -> Self {
        let table = table.into();
        Self {
            server,
            source_schema: source_schema.into(),
            source_table: table.clone(),
            dest_schema: dest_schema.into(),
            dest_table: table,
            batch_size: DEFAULT_BATCH_SIZE,
            row_limit: None,
        }
    }

    /// Set the chunk size (values below 1 are treated as 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Limit the number of source rows fetched.
    pub fn with_row_limit(mut self, row_limit: Option<u64>) -> Self {
        self.row_limit = row_limit;
        self
    }

    /// `schema.table` on the source side.
    pub fn source_label(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }

    /// `schema.table` on the destination side.
    pub fn destination_label(&self) -> String {
        format!("{}.{}", self.dest_schema, self.dest_table)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Terminal status of one table copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    /// Every fetched row was applied.
    Complete,
    /// Some chunks were applied, some were rolled back.
    Partial,
    /// No chunk was applied.
    Failed,
    /// The source returned no rows.
    Empty,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Empty => "empty",
        }
    }
}

/// Result of one table copy.
#[derive(Debug, Clone, Serialize)]
pub struct CopyOutcome {
    pub source: String,
    pub destination: String,
    pub rows_attempted: usize,
    pub rows_applied: usize,
    pub chunks_failed: usize,
    pub status: CopyStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CopyOutcome {
    pub(crate) fn new(
        request: &CopyRequest,
        rows_attempted: usize,
        rows_applied: usize,
        chunks_failed: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = if rows_attempted == 0 {
            CopyStatus::Empty
        } else if rows_applied == rows_attempted {
            CopyStatus::Complete
        } else if rows_applied > 0 {
            CopyStatus::Partial
        } else {
            CopyStatus::Failed
        };

        Self {
            source: request.source_label(),
            destination: request.destination_label(),
            rows_attempted,
            rows_applied,
            chunks_failed,
            status,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// True iff every fetched row was applied.
    pub fn succeeded(&self) -> bool {
        self.status == CopyStatus::Complete
    }

    /// Wall-clock duration in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
