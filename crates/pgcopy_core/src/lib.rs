//! Core library for pgcopy.
//!
//! Copies PostgreSQL tables from a source reachable only through an SSH
//! bastion into destination databases registered on the source as dblink
//! foreign servers.
//!
//! - **error**: Error handling with PostgreSQL-specific details
//! - **models**: Tunnel, copy and routing data structures
//! - **services**: Tunnel forwarding, schema reconciliation, replication
//! - **config**: TOML run configuration
//! - **sql**: Identifier and literal quoting
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod sql;

pub use config::ReplicatorConfig;
pub use error::PgCopyError;
pub use models::{
    BastionConfig, CellValue, CopyOutcome, CopyRequest, CopyStatus, DispatchReport, ForwardTarget,
    RouteEntry, RoutingTable, ScalarValue, TunnelIdentity,
};
pub use services::{Pipeline, ReplicationEngine, RouteDispatcher, TunnelForwarder, TunnelService};
