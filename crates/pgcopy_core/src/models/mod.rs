//! Data models for pgcopy.
//!
//! - `tunnel` - BastionConfig, TunnelIdentity, ForwardTarget
//! - `copy` - CellValue, reconciled schema types, CopyRequest, CopyOutcome
//! - `route` - RouteEntry, RoutingTable, DispatchReport

pub mod copy;
pub mod route;
pub mod tunnel;

pub use copy::{
    CellValue, ColumnSet, CopyOutcome, CopyRequest, CopyStatus, DeclaredType, DestinationTypeMap,
    Reconciliation, RemoteColumn, RemoteServer, ScalarValue,
};
pub use route::{DispatchReport, RouteEntry, RoutingTable, TableResult};
pub use tunnel::{BastionConfig, ForwardTarget, TunnelIdentity};
