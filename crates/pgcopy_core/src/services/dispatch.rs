//! Runs every (destination, table) pair of a routing table.

use tokio_util::sync::CancellationToken;

use crate::models::copy::DEFAULT_BATCH_SIZE;
use crate::models::{CopyRequest, DispatchReport, RouteEntry, RoutingTable, TableResult};
use crate::services::replication::ReplicationEngine;
use crate::services::session::SqlSession;

/// Iterates a [`RoutingTable`] and copies each table through a
/// [`ReplicationEngine`]. A failing table never stops the others.
pub struct RouteDispatcher<'a> {
    session: &'a dyn SqlSession,
    cancel: CancellationToken,
    span: tracing::Span,
    batch_size: usize,
    row_limit: Option<u64>,
}

impl<'a> RouteDispatcher<'a> {
    pub fn new(session: &'a dyn SqlSession, cancel: CancellationToken, span: tracing::Span) -> Self {
        Self { session, cancel, span, batch_size: DEFAULT_BATCH_SIZE, row_limit: None }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_row_limit(mut self, row_limit: Option<u64>) -> Self {
        self.row_limit = row_limit;
        self
    }

    /// Copy every table of every route from `source_schema`.
    pub async fn dispatch(&self, routes: &RoutingTable, source_schema: &str) -> DispatchReport {
        let mut report = DispatchReport::default();

        tracing::info!(
            parent: &self.span,
            routes = routes.routes.len(),
            tables = routes.table_count(),
            "Starting dispatch"
        );

        for route in &routes.routes {
            let server = route.remote_server(&routes.server_prefix);
            let span = tracing::info_span!(
                parent: &self.span,
                "route",
                host = %route.host,
                database = %route.database,
                server = %server.name,
            );
            let engine = ReplicationEngine::new(self.session, self.cancel.clone(), span.clone());

            for table in &route.tables {
                if self.cancel.is_cancelled() {
                    report.push(failed(route, table, "Cancelled before start".to_string()));
                    continue;
                }

                tracing::info!(
                    parent: &span,
                    "→ Copying {source_schema}.{table} to {}/{}.{table}",
                    route.database,
                    route.schema
                );

                let request = CopyRequest::new(server.clone(), source_schema, table.as_str(), &route.schema)
                    .with_batch_size(self.batch_size)
                    .with_row_limit(self.row_limit);

                match engine.copy_table(&request).await {
                    Ok(outcome) => report.push(TableResult {
                        host: route.host.clone(),
                        database: route.database.clone(),
                        table: table.clone(),
                        outcome: Some(outcome),
                        error: None,
                    }),
                    Err(e) => {
                        tracing::error!(
                            parent: &span,
                            table = %table,
                            category = e.category(),
                            hint = e.hint().unwrap_or_default(),
                            code = e.pg_code().unwrap_or_default(),
                            error = %e,
                            "Table copy failed"
                        );
                        report.push(failed(route, table, e.to_string()));
                    }
                }
            }
        }

        tracing::info!(
            parent: &self.span,
            succeeded = report.succeeded_count(),
            failed = report.failed_count(),
            "Dispatch finished"
        );
        report
    }
}

fn failed(route: &RouteEntry, table: &str, error: String) -> TableResult {
    TableResult {
        host: route.host.clone(),
        database: route.database.clone(),
        table: table.to_string(),
        outcome: None,
        error: Some(error),
    }
}
