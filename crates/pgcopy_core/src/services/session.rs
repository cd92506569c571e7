//! Source database session.
//!
//! [`SqlSession`] is the only surface the schema reconciler and replication
//! engine use to talk to the source. Statements for the destination travel
//! through it too, wrapped in `dblink` calls. The production implementation is
//! a plain `tokio_postgres::Client` connected through the tunnel endpoint.

use crate::error::PgCopyError;
use crate::models::{CellValue, ScalarValue};
use crate::sql;

use async_trait::async_trait;
use fallible_iterator::FallibleIterator;
use postgres_protocol::types::array_from_sql;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Client, NoTls, Row, SimpleQueryMessage};

/// Application name reported to PostgreSQL.
const APPLICATION_NAME: &str = "pgcopy";

/// Source database statements used by the copy pipeline.
#[async_trait]
pub trait SqlSession: Send + Sync {
    /// Run one or more statements that return no rows.
    async fn batch_execute(&self, sql: &str) -> Result<(), PgCopyError>;

    /// Run a query and return every column in text form.
    async fn query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, PgCopyError>;

    /// Fetch rows for `plan`, each value classified into a [`CellValue`].
    async fn fetch_rows(&self, plan: &SelectPlan) -> Result<Vec<Vec<CellValue>>, PgCopyError>;
}

/// How a column is selected so its value can be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnCast {
    /// Decoded from its own binary representation.
    Native,
    /// Selected as `col::text`.
    Text,
    /// Selected as `col::text[]`.
    TextArray,
}

/// Column projection of one source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectPlan {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub limit: Option<u64>,
}

impl SelectPlan {
    /// Plain projection.
    pub fn sql(&self) -> String {
        self.sql_with_casts(&[])
    }

    /// Projection with per-column casts; missing entries mean [`ColumnCast::Native`].
    pub fn sql_with_casts(&self, casts: &[ColumnCast]) -> String {
        let select_list = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let ident = sql::quote_ident(column);
                match casts.get(i).copied().unwrap_or(ColumnCast::Native) {
                    ColumnCast::Native => ident,
                    ColumnCast::Text => format!("{ident}::text AS {ident}"),
                    ColumnCast::TextArray => format!("{ident}::text[] AS {ident}"),
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("SELECT {select_list} FROM {}", sql::qualify(&self.schema, &self.table));
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }
}

#[async_trait]
impl SqlSession for Client {
    async fn batch_execute(&self, sql: &str) -> Result<(), PgCopyError> {
        Client::batch_execute(self, sql).await.map_err(PgCopyError::from)
    }

    async fn query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, PgCopyError> {
        let messages = self.simple_query(sql).await?;
        Ok(messages
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => {
                    Some((0..row.len()).map(|i| row.get(i).map(String::from)).collect())
                }
                _ => None,
            })
            .collect())
    }

    async fn fetch_rows(&self, plan: &SelectPlan) -> Result<Vec<Vec<CellValue>>, PgCopyError> {
        // Describe first, then re-project so every column arrives in a decodable type
        let described = self.prepare(&plan.sql()).await?;
        let casts: Vec<ColumnCast> = described.columns().iter().map(|c| column_cast(c.type_())).collect();
        let statement = plan.sql_with_casts(&casts);

        tracing::debug!(sql = %statement, "Fetching source rows");

        let rows = self.query(statement.as_str(), &[]).await?;
        rows.iter().map(decode_row).collect()
    }
}

fn is_native_scalar(ty: &Type) -> bool {
    [
        Type::BOOL,
        Type::INT2,
        Type::INT4,
        Type::INT8,
        Type::FLOAT4,
        Type::FLOAT8,
        Type::TEXT,
        Type::VARCHAR,
        Type::BPCHAR,
        Type::NAME,
        Type::JSON,
        Type::JSONB,
        Type::BYTEA,
    ]
    .contains(ty)
}

/// Pick the projection that makes `ty` decodable.
pub fn column_cast(ty: &Type) -> ColumnCast {
    match ty.kind() {
        Kind::Array(element) if is_native_scalar(element) => ColumnCast::Native,
        Kind::Array(_) => ColumnCast::TextArray,
        _ if is_native_scalar(ty) => ColumnCast::Native,
        _ => ColumnCast::Text,
    }
}

fn decode_row(row: &Row) -> Result<Vec<CellValue>, PgCopyError> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

fn decode_cell(row: &Row, idx: usize) -> Result<CellValue, PgCopyError> {
    let ty = row.columns()[idx].type_().clone();
    match ty.kind() {
        Kind::Array(_) => decode_array(row, idx),
        _ => decode_scalar(row, idx, &ty),
    }
}

fn scalar<'a, T: FromSql<'a>>(
    row: &'a Row,
    idx: usize,
    wrap: impl Fn(T) -> CellValue,
) -> Result<CellValue, PgCopyError> {
    Ok(row.try_get::<usize, Option<T>>(idx)?.map(wrap).unwrap_or(CellValue::Null))
}

fn decode_scalar(row: &Row, idx: usize, ty: &Type) -> Result<CellValue, PgCopyError> {
    match ty.clone() {
        Type::BOOL => scalar(row, idx, |v: bool| CellValue::Scalar(ScalarValue::Bool(v))),
        Type::INT2 => scalar(row, idx, |v: i16| CellValue::int(v.into())),
        Type::INT4 => scalar(row, idx, |v: i32| CellValue::int(v.into())),
        Type::INT8 => scalar(row, idx, CellValue::int),
        Type::FLOAT4 => scalar(row, idx, |v: f32| CellValue::Scalar(ScalarValue::Float(v.into()))),
        Type::FLOAT8 => scalar(row, idx, |v: f64| CellValue::Scalar(ScalarValue::Float(v))),
        Type::JSON | Type::JSONB => scalar(row, idx, CellValue::Structured),
        Type::BYTEA => scalar(row, idx, CellValue::Binary),
        // text, varchar, bpchar, name and everything projected as ::text
        _ => scalar(row, idx, |v: String| CellValue::text(v)),
    }
}

fn decode_array(row: &Row, idx: usize) -> Result<CellValue, PgCopyError> {
    Ok(row.try_get::<usize, Option<NestedArray>>(idx)?.map(|a| a.0).unwrap_or(CellValue::Null))
}

/// An array value of any dimensionality as nested [`CellValue::Sequence`]s.
/// Lower bounds are not kept; every dimension restarts at 1 on insert.
struct NestedArray(CellValue);

impl<'a> FromSql<'a> for NestedArray {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let Kind::Array(element) = ty.kind() else {
            return Err(format!("{ty} is not an array type").into());
        };

        let array = array_from_sql(raw)?;
        let dimensions: Vec<usize> = array
            .dimensions()
            .map(|d| Ok(usize::try_from(d.len).unwrap_or(0)))
            .collect()?;
        let values: Vec<CellValue> =
            array.values().map(|value| decode_element(element, value)).collect()?;

        Ok(Self(nest(&mut values.into_iter(), &dimensions)))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Array(_))
    }
}

fn decode_element(element: &Type, raw: Option<&[u8]>) -> Result<CellValue, Box<dyn Error + Sync + Send>> {
    let Some(raw) = raw else {
        return Ok(CellValue::Null);
    };

    Ok(match element.clone() {
        Type::BOOL => CellValue::Scalar(ScalarValue::Bool(bool::from_sql(element, raw)?)),
        Type::INT2 => CellValue::int(i16::from_sql(element, raw)?.into()),
        Type::INT4 => CellValue::int(i32::from_sql(element, raw)?.into()),
        Type::INT8 => CellValue::int(i64::from_sql(element, raw)?),
        Type::FLOAT4 => CellValue::Scalar(ScalarValue::Float(f32::from_sql(element, raw)?.into())),
        Type::FLOAT8 => CellValue::Scalar(ScalarValue::Float(f64::from_sql(element, raw)?)),
        Type::JSON | Type::JSONB => CellValue::Structured(serde_json::Value::from_sql(element, raw)?),
        Type::BYTEA => CellValue::Binary(Vec::<u8>::from_sql(element, raw)?),
        _ => CellValue::text(String::from_sql(element, raw)?),
    })
}

/// Rebuild row-major `values` into one nesting level per dimension.
fn nest(values: &mut std::vec::IntoIter<CellValue>, dimensions: &[usize]) -> CellValue {
    match dimensions.split_first() {
        None => CellValue::Sequence(Vec::new()),
        Some((&len, [])) => CellValue::Sequence(values.by_ref().take(len).collect()),
        Some((&len, inner)) => CellValue::Sequence((0..len).map(|_| nest(values, inner)).collect()),
    }
}

// ============================================================================
// Connection through the tunnel endpoint
// ============================================================================

/// Login for the source database.
#[derive(Clone)]
pub struct SourceLogin {
    pub database: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl fmt::Debug for SourceLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceLogin")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// A source client plus the task driving its socket.
pub struct SourceConnection {
    client: Client,
    driver: JoinHandle<()>,
}

impl SourceConnection {
    /// Connect to the source database at `endpoint` (normally the local
    /// tunnel address).
    pub async fn connect(endpoint: SocketAddr, login: &SourceLogin) -> Result<Self, PgCopyError> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&endpoint.ip().to_string());
        pg_config.port(endpoint.port());
        pg_config.dbname(&login.database);
        pg_config.user(&login.username);
        pg_config.password(&login.password);
        pg_config.application_name(APPLICATION_NAME);
        pg_config.options("-c client_encoding=UTF8");
        pg_config.connect_timeout(login.connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let (client, connection) = pg_config.connect(NoTls).await.map_err(|e| {
            PgCopyError::connection_with_source(
                format!("Failed to connect to source database {}", login.database),
                e,
            )
        })?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "Source connection terminated with error");
            }
        });

        tracing::info!(
            endpoint = %endpoint,
            database = %login.database,
            "Connected to source database"
        );

        Ok(Self { client, driver })
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Drop the client and wait for the connection task to finish.
    pub async fn close(self) {
        drop(self.client);
        if let Err(e) = self.driver.await {
            tracing::debug!(error = %e, "Source connection task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> SelectPlan {
        SelectPlan {
            schema: "public".to_string(),
            table: "orders".to_string(),
            columns: vec!["id".to_string(), "status".to_string(), "tags".to_string()],
            limit: None,
        }
    }

    #[test]
    fn test_plain_projection() {
        assert_eq!(plan().sql(), "SELECT \"id\", \"status\", \"tags\" FROM \"public\".\"orders\"");
    }

    #[test]
    fn test_projection_with_limit_and_casts() {
        let plan = SelectPlan { limit: Some(10), ..plan() };
        let sql = plan.sql_with_casts(&[ColumnCast::Native, ColumnCast::Text, ColumnCast::TextArray]);
        assert_eq!(
            sql,
            "SELECT \"id\", \"status\"::text AS \"status\", \"tags\"::text[] AS \"tags\" \
             FROM \"public\".\"orders\" LIMIT 10"
        );
    }

    #[test]
    fn test_column_cast_selection() {
        assert_eq!(column_cast(&Type::INT4), ColumnCast::Native);
        assert_eq!(column_cast(&Type::JSONB), ColumnCast::Native);
        assert_eq!(column_cast(&Type::TEXT_ARRAY), ColumnCast::Native);
        assert_eq!(column_cast(&Type::TIMESTAMPTZ), ColumnCast::Text);
        assert_eq!(column_cast(&Type::NUMERIC), ColumnCast::Text);
        assert_eq!(column_cast(&Type::UUID_ARRAY), ColumnCast::TextArray);
    }

    #[test]
    fn test_login_debug_hides_password() {
        let login = SourceLogin {
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: "pw-123".to_string(),
            connect_timeout: Duration::from_secs(10),
        };
        assert!(!format!("{login:?}").contains("pw-123"));
    }

    /// Binary array wire format: header, one (len, lower bound) pair per
    /// dimension, then length-prefixed elements in row-major order.
    fn wire_array(element_oid: u32, dims: &[i32], values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(dims.len() as i32).to_be_bytes());
        buf.extend_from_slice(&i32::from(values.iter().any(Option::is_none)).to_be_bytes());
        buf.extend_from_slice(&element_oid.to_be_bytes());
        for len in dims {
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&1i32.to_be_bytes());
        }
        for value in values {
            match value {
                Some(bytes) => {
                    buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    buf.extend_from_slice(bytes);
                }
                None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        buf
    }

    #[test]
    fn test_two_dimensional_int_array_decodes_nested() {
        let (one, two, three) = (1i32.to_be_bytes(), 2i32.to_be_bytes(), 3i32.to_be_bytes());
        let raw = wire_array(
            Type::INT4.oid(),
            &[2, 2],
            &[Some(&one[..]), Some(&two[..]), Some(&three[..]), None],
        );

        let decoded = NestedArray::from_sql(&Type::INT4_ARRAY, &raw).unwrap().0;
        assert_eq!(
            decoded,
            CellValue::Sequence(vec![
                CellValue::Sequence(vec![CellValue::int(1), CellValue::int(2)]),
                CellValue::Sequence(vec![CellValue::int(3), CellValue::Null]),
            ])
        );
    }

    #[test]
    fn test_text_array_decodes_flat() {
        let raw = wire_array(Type::TEXT.oid(), &[3], &[Some(&b"a"[..]), None, Some(&b"b c"[..])]);
        let decoded = NestedArray::from_sql(&Type::TEXT_ARRAY, &raw).unwrap().0;
        assert_eq!(
            decoded,
            CellValue::Sequence(vec![CellValue::text("a"), CellValue::Null, CellValue::text("b c")])
        );
    }

    #[test]
    fn test_empty_array_decodes_to_empty_sequence() {
        let raw = wire_array(Type::INT4.oid(), &[], &[]);
        let decoded = NestedArray::from_sql(&Type::INT4_ARRAY, &raw).unwrap().0;
        assert_eq!(decoded, CellValue::Sequence(Vec::new()));
    }

    #[test]
    fn test_nested_array_only_accepts_arrays() {
        assert!(<NestedArray as FromSql>::accepts(&Type::JSONB_ARRAY));
        assert!(!<NestedArray as FromSql>::accepts(&Type::INT4));
    }
}
