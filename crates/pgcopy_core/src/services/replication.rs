//! Batch replication of one table into a destination reached through dblink.
//!
//! Each chunk is applied in its own transaction on the source session. The
//! destination statement runs through `dblink_exec`, so a failed chunk is
//! rolled back on both sides and the remaining chunks still run.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::PgCopyError;
use crate::models::{CellValue, CopyOutcome, CopyRequest, Reconciliation, RemoteServer};
use crate::services::literal::LiteralEncoder;
use crate::services::schema::SchemaReconciler;
use crate::services::session::{SelectPlan, SqlSession};
use crate::sql;

/// Copies tables from the source session into registered destinations.
pub struct ReplicationEngine<'a> {
    session: &'a dyn SqlSession,
    encoder: LiteralEncoder,
    cancel: CancellationToken,
    span: tracing::Span,
}

impl<'a> ReplicationEngine<'a> {
    /// Create an engine whose events are recorded inside `span`.
    pub fn new(session: &'a dyn SqlSession, cancel: CancellationToken, span: tracing::Span) -> Self {
        Self { session, encoder: LiteralEncoder::default(), cancel, span }
    }

    /// Register `server` as a postgres_fdw foreign server with a user mapping
    /// for the current user. Safe to repeat: an existing server is dropped
    /// and recreated.
    pub async fn register(&self, server: &RemoteServer) -> Result<(), PgCopyError> {
        for statement in registration_statements(server)? {
            self.session.batch_execute(&statement).await?;
        }

        tracing::info!(
            server = %server.name,
            host = %server.host,
            port = server.port,
            database = %server.database,
            user = %server.username,
            "Registered foreign server"
        );
        Ok(())
    }

    /// Copy one table.
    ///
    /// Registration, schema and fetch failures are returned as errors. Chunk
    /// failures are logged and reflected in the outcome.
    pub async fn copy_table(&self, request: &CopyRequest) -> Result<CopyOutcome, PgCopyError> {
        let span = tracing::info_span!(parent: &self.span, "copy", table = %request.source_label());
        self.copy_table_inner(request).instrument(span).await
    }

    async fn copy_table_inner(&self, request: &CopyRequest) -> Result<CopyOutcome, PgCopyError> {
        let started_at = Utc::now();
        tracing::debug!(table = %request.source_label(), state = "init", "Starting table copy");

        self.register(&request.server).await?;
        tracing::debug!(server = %request.server.name, state = "registration_ready", "Destination registered");

        let reconciliation = SchemaReconciler::reconcile_tables(
            self.session,
            &request.server.name,
            (request.source_schema.as_str(), request.source_table.as_str()),
            (request.dest_schema.as_str(), request.dest_table.as_str()),
        )
        .await?;
        tracing::debug!(
            columns = ?reconciliation.columns.names(),
            state = "schema_reconciled",
            "Columns reconciled"
        );

        let plan = SelectPlan {
            schema: request.source_schema.clone(),
            table: request.source_table.clone(),
            columns: reconciliation.columns.names().to_vec(),
            limit: request.row_limit,
        };
        let rows = self.session.fetch_rows(&plan).await?;

        if rows.is_empty() {
            tracing::warn!(table = %request.source_label(), "No rows to copy");
            return Ok(CopyOutcome::new(request, 0, 0, 0, started_at));
        }
        tracing::debug!(rows = rows.len(), state = "rows_fetched", "Fetched source rows");

        let mut applied = 0;
        let mut chunks_failed = 0;

        for (index, chunk) in rows.chunks(request.batch_size).enumerate() {
            let number = index + 1;

            if self.cancel.is_cancelled() {
                tracing::warn!(
                    table = %request.source_label(),
                    chunk = number,
                    remaining = rows.len() - index * request.batch_size,
                    "Copy cancelled before chunk"
                );
                break;
            }

            tracing::debug!(chunk = number, rows = chunk.len(), state = "applying", "Applying chunk");

            match self.apply_chunk(request, &reconciliation, chunk).await {
                Ok(()) => {
                    applied += chunk.len();
                    tracing::debug!(chunk = number, state = "committed", "Chunk committed");
                }
                Err(e) => {
                    chunks_failed += 1;
                    let failure = PgCopyError::chunk_apply(number, e.to_string());
                    tracing::error!(
                        table = %request.destination_label(),
                        chunk = number,
                        rows = chunk.len(),
                        error = %failure,
                        state = "rolled_back",
                        "Chunk rolled back"
                    );
                }
            }
        }

        let outcome = CopyOutcome::new(request, rows.len(), applied, chunks_failed, started_at);
        tracing::info!(
            source = %outcome.source,
            destination = %outcome.destination,
            rows_attempted = outcome.rows_attempted,
            rows_applied = outcome.rows_applied,
            chunks_failed = outcome.chunks_failed,
            status = outcome.status.as_str(),
            elapsed_ms = outcome.elapsed_ms(),
            "Table copy finished"
        );
        Ok(outcome)
    }

    async fn apply_chunk(
        &self,
        request: &CopyRequest,
        reconciliation: &Reconciliation,
        chunk: &[Vec<CellValue>],
    ) -> Result<(), PgCopyError> {
        self.session.batch_execute("BEGIN").await?;

        let applied = match self.remote_insert(request, reconciliation, chunk) {
            Ok(statement) => self.session.batch_execute(&statement).await,
            Err(e) => Err(e),
        };

        let finished = match applied {
            Ok(()) => self.session.batch_execute("COMMIT").await,
            Err(e) => Err(e),
        };

        if let Err(e) = finished {
            if let Err(rollback) = self.session.batch_execute("ROLLBACK").await {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// `SELECT dblink_exec('srv', '<INSERT ...>')` for one chunk.
    pub fn remote_insert(
        &self,
        request: &CopyRequest,
        reconciliation: &Reconciliation,
        chunk: &[Vec<CellValue>],
    ) -> Result<String, PgCopyError> {
        let types = reconciliation.ordered_types();
        if types.len() != reconciliation.columns.len() {
            return Err(PgCopyError::internal("Reconciled columns are missing declared types"));
        }

        let values = chunk
            .iter()
            .map(|row| {
                let literals: Vec<String> = row
                    .iter()
                    .zip(types.iter())
                    .map(|(value, ty)| self.encoder.typed(value, ty))
                    .collect();
                format!("({})", literals.join(", "))
            })
            .collect::<Vec<_>>()
            .join(", ");

        let insert = format!(
            "INSERT INTO {} ({}) VALUES {}",
            sql::qualify(&request.dest_schema, &request.dest_table),
            sql::ident_list(reconciliation.columns.iter()),
            values,
        );

        Ok(format!(
            "SELECT dblink_exec({}, {})",
            sql::quote_literal(&request.server.name)?,
            sql::quote_literal(&insert)?,
        ))
    }
}

/// Extension, foreign server and user mapping statements for `server`.
pub fn registration_statements(server: &RemoteServer) -> Result<Vec<String>, PgCopyError> {
    let name = sql::quote_ident(&server.name);
    Ok(vec![
        "CREATE EXTENSION IF NOT EXISTS dblink".to_string(),
        "CREATE EXTENSION IF NOT EXISTS postgres_fdw".to_string(),
        format!("DROP SERVER IF EXISTS {name} CASCADE"),
        format!(
            "CREATE SERVER {name} FOREIGN DATA WRAPPER postgres_fdw OPTIONS (host {}, port {}, dbname {})",
            sql::quote_literal(&server.host)?,
            sql::quote_literal(&server.port.to_string())?,
            sql::quote_literal(&server.database)?,
        ),
        format!(
            "CREATE USER MAPPING FOR CURRENT_USER SERVER {name} OPTIONS (user {}, password {})",
            sql::quote_literal(&server.username)?,
            sql::quote_literal(&server.password)?,
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CopyStatus;
    use crate::services::testing::RecordingSession;

    fn server() -> RemoteServer {
        RemoteServer {
            name: "pgcopy_app".to_string(),
            host: "10.0.0.5".to_string(),
            port: 5432,
            database: "app".to_string(),
            username: "postgres".to_string(),
            password: "s3cret".to_string(),
        }
    }

    fn request() -> CopyRequest {
        CopyRequest::new(server(), "public", "orders", "public")
    }

    fn orders_session() -> RecordingSession {
        RecordingSession::new()
            .with_remote_columns(&[("id", "integer"), ("name", "text")])
            .with_local_columns(&["id", "name", "legacy"])
    }

    fn engine(session: &RecordingSession) -> ReplicationEngine<'_> {
        ReplicationEngine::new(session, CancellationToken::new(), tracing::Span::none())
    }

    fn row(id: i64, name: &str) -> Vec<CellValue> {
        vec![CellValue::int(id), CellValue::text(name)]
    }

    #[test]
    fn test_registration_statements() {
        let statements = registration_statements(&server()).unwrap();
        assert_eq!(statements[0], "CREATE EXTENSION IF NOT EXISTS dblink");
        assert_eq!(statements[1], "CREATE EXTENSION IF NOT EXISTS postgres_fdw");
        assert_eq!(statements[2], "DROP SERVER IF EXISTS \"pgcopy_app\" CASCADE");
        assert_eq!(
            statements[3],
            "CREATE SERVER \"pgcopy_app\" FOREIGN DATA WRAPPER postgres_fdw \
             OPTIONS (host '10.0.0.5', port '5432', dbname 'app')"
        );
        assert_eq!(
            statements[4],
            "CREATE USER MAPPING FOR CURRENT_USER SERVER \"pgcopy_app\" \
             OPTIONS (user 'postgres', password 's3cret')"
        );
    }

    #[tokio::test]
    async fn test_failed_chunk_rolls_back_and_next_chunk_commits() {
        let session = orders_session().with_rows(vec![row(1, "a"), row(2, "b")]).failing_exec(1);

        let outcome = engine(&session).copy_table(&request().with_batch_size(1)).await.unwrap();

        assert!(!outcome.succeeded());
        assert_eq!(outcome.status, CopyStatus::Partial);
        assert_eq!(outcome.rows_attempted, 2);
        assert_eq!(outcome.rows_applied, 1);
        assert_eq!(outcome.chunks_failed, 1);
        assert_eq!(session.count("BEGIN"), 2);
        assert_eq!(session.count("ROLLBACK"), 1);
        assert_eq!(session.count("COMMIT"), 1);

        let execs: Vec<String> =
            session.statements().into_iter().filter(|s| s.starts_with("SELECT dblink_exec(")).collect();
        assert_eq!(execs.len(), 2);
        assert!(execs[1].contains("VALUES (2::integer, ''b''::text)"));
    }

    #[tokio::test]
    async fn test_registration_is_repeatable() {
        let session = orders_session().with_rows(vec![row(1, "a")]);
        let engine = engine(&session);

        assert!(engine.copy_table(&request()).await.unwrap().succeeded());
        assert!(engine.copy_table(&request()).await.unwrap().succeeded());

        assert_eq!(session.count("CREATE EXTENSION IF NOT EXISTS dblink"), 2);
        assert_eq!(session.count("DROP SERVER IF EXISTS \"pgcopy_app\" CASCADE"), 2);
        assert_eq!(session.count("COMMIT"), 2);
    }

    #[tokio::test]
    async fn test_zero_rows_is_empty() {
        let session = orders_session();
        let outcome = engine(&session).copy_table(&request()).await.unwrap();

        assert_eq!(outcome.status, CopyStatus::Empty);
        assert!(!outcome.succeeded());
        assert_eq!(session.count("BEGIN"), 0);
    }

    #[tokio::test]
    async fn test_no_overlap_skips_fetch() {
        let session = RecordingSession::new()
            .with_remote_columns(&[("only_remote", "text")])
            .with_local_columns(&["only_local"])
            .with_rows(vec![vec![CellValue::text("x")]]);

        let err = engine(&session).copy_table(&request()).await.unwrap_err();

        assert!(matches!(err, PgCopyError::NoOverlap { .. }));
        assert_eq!(session.fetch_count(), 0);
        assert_eq!(session.count("BEGIN"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_copy_applies_nothing() {
        let session = orders_session().with_rows(vec![row(1, "a"), row(2, "b")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ReplicationEngine::new(&session, cancel, tracing::Span::none())
            .copy_table(&request())
            .await
            .unwrap();

        assert_eq!(outcome.status, CopyStatus::Failed);
        assert_eq!(outcome.rows_applied, 0);
        assert_eq!(session.count("BEGIN"), 0);
    }

    #[tokio::test]
    async fn test_row_limit_reaches_fetch() {
        let session = orders_session().with_rows(vec![row(1, "a"), row(2, "b"), row(3, "c")]);
        let outcome =
            engine(&session).copy_table(&request().with_row_limit(Some(2))).await.unwrap();

        assert_eq!(outcome.rows_attempted, 2);
        assert!(session.statements().iter().any(|s| s.ends_with("LIMIT 2")));
    }

    #[test]
    fn test_remote_insert_shape() {
        let session = orders_session();
        let reconciliation = SchemaReconciler::reconcile(
            &[
                crate::models::RemoteColumn::new("id", "integer"),
                crate::models::RemoteColumn::new("name", "text"),
            ],
            &["id".to_string(), "name".to_string()].into_iter().collect(),
        )
        .unwrap();

        let statement = engine(&session)
            .remote_insert(&request(), &reconciliation, &[row(1, "O'Brien"), vec![CellValue::Null, CellValue::Null]])
            .unwrap();

        assert_eq!(
            statement,
            "SELECT dblink_exec('pgcopy_app', 'INSERT INTO \"public\".\"orders\" (\"id\", \"name\") \
             VALUES (1::integer, ''O''''Brien''::text), (NULL::integer, NULL::text)')"
        );
    }
}
