//! Schema reconciliation between a source table and its destination.
//!
//! The destination is described through `dblink` from the source session, so
//! both catalogs are read over the same connection.

use std::collections::HashSet;

use crate::error::PgCopyError;
use crate::models::{ColumnSet, DestinationTypeMap, Reconciliation, RemoteColumn};
use crate::services::session::SqlSession;
use crate::sql;

/// Destination/source column reconciliation.
pub struct SchemaReconciler;

impl SchemaReconciler {
    /// Describe the destination table through the registered foreign server.
    ///
    /// Generated, dropped and system columns are excluded. Columns come back
    /// in ordinal order.
    pub async fn describe_remote(
        session: &dyn SqlSession,
        server: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<RemoteColumn>, PgCopyError> {
        let catalog_query = format!(
            "SELECT a.attname::text, pg_catalog.format_type(a.atttypid, a.atttypmod) \
             FROM pg_catalog.pg_attribute a \
             JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = {} AND c.relname = {} \
             AND a.attnum > 0 AND NOT a.attisdropped AND a.attgenerated = '' \
             ORDER BY a.attnum",
            sql::quote_literal(schema)?,
            sql::quote_literal(table)?,
        );

        let query = format!(
            "SELECT column_name, column_type FROM dblink({}, {}) AS t(column_name text, column_type text)",
            sql::quote_literal(server)?,
            sql::quote_literal(&catalog_query)?,
        );

        let rows = session.query_text(&query).await?;
        let columns: Vec<RemoteColumn> = rows
            .into_iter()
            .filter_map(|row| {
                let mut cells = row.into_iter();
                match (cells.next().flatten(), cells.next().flatten()) {
                    (Some(name), Some(ty)) => Some(RemoteColumn::new(name, ty)),
                    _ => None,
                }
            })
            .collect();

        if columns.is_empty() {
            return Err(PgCopyError::schema_not_found(schema, table));
        }

        tracing::debug!(
            server = %server,
            table = %format!("{schema}.{table}"),
            columns = columns.len(),
            "Described destination table"
        );

        Ok(columns)
    }

    /// Column names of the source table.
    pub async fn describe_local(
        session: &dyn SqlSession,
        schema: &str,
        table: &str,
    ) -> Result<HashSet<String>, PgCopyError> {
        let query = format!(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = {} AND table_name = {}",
            sql::quote_literal(schema)?,
            sql::quote_literal(table)?,
        );

        let rows = session.query_text(&query).await?;
        Ok(rows.into_iter().filter_map(|row| row.into_iter().next().flatten()).collect())
    }

    /// Keep remote columns that also exist locally, in remote order.
    pub fn reconcile(
        remote: &[RemoteColumn],
        local: &HashSet<String>,
    ) -> Result<Reconciliation, PgCopyError> {
        let columns: Vec<String> =
            remote.iter().filter(|c| local.contains(&c.name)).map(|c| c.name.clone()).collect();

        if columns.is_empty() {
            return Err(PgCopyError::no_overlap("source", "destination"));
        }

        Ok(Reconciliation {
            columns: ColumnSet::new(columns),
            types: DestinationTypeMap::from_columns(remote),
        })
    }

    /// Describe both sides and reconcile them.
    pub async fn reconcile_tables(
        session: &dyn SqlSession,
        server: &str,
        source: (&str, &str),
        destination: (&str, &str),
    ) -> Result<Reconciliation, PgCopyError> {
        let remote = Self::describe_remote(session, server, destination.0, destination.1).await?;
        let local = Self::describe_local(session, source.0, source.1).await?;

        Self::reconcile(&remote, &local).map_err(|_| {
            PgCopyError::no_overlap(
                format!("{}.{}", source.0, source.1),
                format!("{}.{}", destination.0, destination.1),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::RecordingSession;

    fn local(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_reconcile_keeps_remote_order() {
        let remote = vec![RemoteColumn::new("id", "integer"), RemoteColumn::new("name", "text")];
        let result = SchemaReconciler::reconcile(&remote, &local(&["name", "id", "ignored"])).unwrap();

        assert_eq!(result.columns.names(), &["id".to_string(), "name".to_string()]);
        assert_eq!(result.types.get("id").map(|t| t.as_str()), Some("integer"));
        let types: Vec<&str> = result.ordered_types().iter().map(|t| t.as_str()).collect();
        assert_eq!(types, vec!["integer", "text"]);
    }

    #[test]
    fn test_reconcile_without_overlap_fails() {
        let remote = vec![RemoteColumn::new("only_remote", "text")];
        let err = SchemaReconciler::reconcile(&remote, &local(&["only_local"])).unwrap_err();
        assert!(matches!(err, PgCopyError::NoOverlap { .. }));
    }

    #[tokio::test]
    async fn test_describe_remote_wraps_catalog_query_in_dblink() {
        let session = RecordingSession::new()
            .with_remote_columns(&[("id", "integer"), ("tags", "text[]")]);

        let columns = SchemaReconciler::describe_remote(&session, "pgcopy_app", "public", "orders")
            .await
            .unwrap();

        assert_eq!(columns.len(), 2);
        assert!(columns[1].declared_type.is_array());

        let statements = session.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].starts_with("SELECT column_name, column_type FROM dblink('pgcopy_app', "));
        assert!(statements[0].contains("attgenerated = ''''"));
        assert!(statements[0].contains("n.nspname = ''public''"));
    }

    #[tokio::test]
    async fn test_describe_remote_missing_table() {
        let session = RecordingSession::new();
        let err = SchemaReconciler::describe_remote(&session, "pgcopy_app", "public", "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, PgCopyError::SchemaNotFound { .. }));
    }

    #[tokio::test]
    async fn test_reconcile_tables_reports_both_labels() {
        let session = RecordingSession::new()
            .with_remote_columns(&[("only_remote", "text")])
            .with_local_columns(&["only_local"]);

        let err = SchemaReconciler::reconcile_tables(
            &session,
            "pgcopy_app",
            ("public", "orders"),
            ("sales", "orders"),
        )
        .await
        .unwrap_err();

        match err {
            PgCopyError::NoOverlap { source_table, destination_table } => {
                assert_eq!(source_table, "public.orders");
                assert_eq!(destination_table, "sales.orders");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
