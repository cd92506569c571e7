//! Routing table and per-run dispatch report.

use crate::models::copy::{CopyOutcome, RemoteServer, DEFAULT_PG_PORT, DEFAULT_PG_USER, DEFAULT_SCHEMA};
use serde::Serialize;
use std::fmt;

/// Default prefix for foreign server names registered on the source.
pub const DEFAULT_SERVER_PREFIX: &str = "pgcopy_";

/// One destination database and the tables copied into it.
#[derive(Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Destination host, as seen from the source database
    pub host: String,
    /// Destination port
    pub port: u16,
    /// Destination database
    pub database: String,
    /// Destination login
    pub username: String,
    /// Destination password
    pub password: String,
    /// Destination schema
    pub schema: String,
    /// Tables to copy (same name on both sides)
    pub tables: Vec<String>,
}

impl RouteEntry {
    /// Create a route with default port, user and schema.
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        password: impl Into<String>,
        tables: Vec<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PG_PORT,
            database: database.into(),
            username: DEFAULT_PG_USER.to_string(),
            password: password.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            tables,
        }
    }

    /// Foreign server name for this destination: `prefix + database` with
    /// dashes replaced so the name stays a plain identifier.
    pub fn server_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.database).replace('-', "_")
    }

    /// Registration parameters for this destination.
    pub fn remote_server(&self, prefix: &str) -> RemoteServer {
        RemoteServer {
            name: self.server_name(prefix),
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("schema", &self.schema)
            .field("tables", &self.tables)
            .finish()
    }
}

/// All destinations for one run.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    pub routes: Vec<RouteEntry>,
    pub server_prefix: String,
}

impl RoutingTable {
    pub fn new(routes: Vec<RouteEntry>) -> Self {
        Self { routes, server_prefix: DEFAULT_SERVER_PREFIX.to_string() }
    }

    pub fn with_server_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.server_prefix = prefix.into();
        self
    }

    /// Total number of table copies the table describes.
    pub fn table_count(&self) -> usize {
        self.routes.iter().map(|r| r.tables.len()).sum()
    }
}

/// What happened to one (destination, table) pair.
#[derive(Debug, Clone, Serialize)]
pub struct TableResult {
    pub host: String,
    pub database: String,
    pub table: String,
    /// Present when the copy ran to completion (successfully or not).
    pub outcome: Option<CopyOutcome>,
    /// Present when the copy was aborted before applying rows.
    pub error: Option<String>,
}

impl TableResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().is_some_and(CopyOutcome::succeeded)
    }
}

/// Per-table results for a whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub tables: Vec<TableResult>,
}

impl DispatchReport {
    pub fn push(&mut self, result: TableResult) {
        self.tables.push(result);
    }

    pub fn all_succeeded(&self) -> bool {
        self.tables.iter().all(TableResult::succeeded)
    }

    pub fn succeeded_count(&self) -> usize {
        self.tables.iter().filter(|t| t.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.tables.len() - self.succeeded_count()
    }
}
