//! Services for pgcopy.
//!
//! - `tunnel` - SSH session to the bastion with host key pinning
//! - `forward` - local listener relaying connections over tunnel channels
//! - `session` - source database session and typed row fetch
//! - `schema` - destination/source column reconciliation
//! - `literal` - destination-typed SQL literals
//! - `replication` - chunked table copy through dblink
//! - `dispatch` - routing table iteration
//! - `secrets` - file, keychain and in-memory secret stores
//! - `pipeline` - end-to-end run

pub mod dispatch;
pub mod forward;
pub mod literal;
pub mod pipeline;
pub mod replication;
pub mod schema;
pub mod secrets;
pub mod session;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::RouteDispatcher;
pub use forward::{ChannelOpener, ForwardHandle, RelayStream, TunnelForwarder};
pub use literal::LiteralEncoder;
pub use pipeline::Pipeline;
pub use replication::ReplicationEngine;
pub use schema::SchemaReconciler;
pub use secrets::{FileSecretStore, KeychainSecretStore, MemorySecretStore, SecretRecord, SecretStore};
pub use session::{SelectPlan, SourceConnection, SqlSession};
pub use tunnel::{TunnelService, TunnelSession};
