//! End-to-end run: tunnel, source connection, dispatch, teardown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReplicatorConfig;
use crate::error::PgCopyError;
use crate::models::copy::DEFAULT_PG_USER;
use crate::models::{DispatchReport, ForwardTarget, TunnelIdentity};
use crate::services::dispatch::RouteDispatcher;
use crate::services::forward::{ForwardHandle, TunnelForwarder};
use crate::services::secrets::{SecretRecord, SecretStore};
use crate::services::session::{SourceConnection, SourceLogin};
use crate::services::tunnel::{TunnelService, TunnelSession};

/// An open SSH session and the forwarder using it.
pub struct OpenTunnel {
    pub session: Arc<TunnelSession>,
    pub forward: ForwardHandle,
}

impl OpenTunnel {
    /// Stop the forwarder, then disconnect the SSH session.
    pub async fn close(self) {
        self.forward.shutdown().await;
        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "SSH session did not close cleanly");
        }
    }
}

/// Runs a full replication from configuration and secrets.
pub struct Pipeline;

impl Pipeline {
    /// Copy every configured route. Tunnel failures abort before any
    /// statement runs; table failures are recorded in the report.
    pub async fn run(
        config: &ReplicatorConfig,
        store: &dyn SecretStore,
        cancel: CancellationToken,
    ) -> Result<DispatchReport, PgCopyError> {
        let span = tracing::info_span!("run", run_id = %Uuid::new_v4());

        let source = store.require(&config.source.secret)?;
        let routes = config.routing_table(store)?;
        let tunnel = Self::open_with_source(config, &source, cancel.child_token(), span.clone()).await?;

        let login = SourceLogin {
            database: config.source.database.clone(),
            username: if source.username.is_empty() {
                DEFAULT_PG_USER.to_string()
            } else {
                source.username.clone()
            },
            password: source.password.clone(),
            connect_timeout: config.connect_timeout(),
        };

        let connection = match SourceConnection::connect(tunnel.forward.local_addr(), &login).await {
            Ok(connection) => connection,
            Err(e) => {
                tunnel.close().await;
                return Err(e);
            }
        };

        let report = RouteDispatcher::new(connection.client(), cancel, span.clone())
            .with_batch_size(config.copy.batch_size)
            .with_row_limit(config.copy.row_limit)
            .dispatch(&routes, &config.source.schema)
            .await;

        connection.close().await;
        tunnel.close().await;

        tracing::info!(
            parent: &span,
            succeeded = report.succeeded_count(),
            failed = report.failed_count(),
            "Run finished"
        );
        Ok(report)
    }

    /// Open the SSH session and start forwarding to the source database.
    pub async fn open_tunnel(
        config: &ReplicatorConfig,
        store: &dyn SecretStore,
        cancel: CancellationToken,
    ) -> Result<OpenTunnel, PgCopyError> {
        let source = store.require(&config.source.secret)?;
        let span = tracing::info_span!("tunnel", run_id = %Uuid::new_v4());
        Self::open_with_source(config, &source, cancel, span).await
    }

    async fn open_with_source(
        config: &ReplicatorConfig,
        source: &SecretRecord,
        cancel: CancellationToken,
        span: tracing::Span,
    ) -> Result<OpenTunnel, PgCopyError> {
        let identity = resolve_identity(config, source)?;
        let session = Arc::new(
            TunnelService::connect(&config.bastion(), &identity, &config.bastion.fingerprint).await?,
        );

        let target = ForwardTarget::new(&source.host, source.port)
            .with_local(&config.tunnel.local_host, config.tunnel.local_port);

        match TunnelForwarder::new(session.clone(), target, span).spawn(cancel).await {
            Ok(forward) => Ok(OpenTunnel { session, forward }),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(error = %close_err, "SSH session did not close cleanly");
                }
                Err(e)
            }
        }
    }
}

/// The bastion key: the configured key file if set, otherwise the source
/// secret's `ssh` field.
pub fn resolve_identity(
    config: &ReplicatorConfig,
    source: &SecretRecord,
) -> Result<TunnelIdentity, PgCopyError> {
    if let Some(path) = &config.bastion.private_key_path {
        let key = std::fs::read_to_string(path).map_err(|e| {
            PgCopyError::io(format!("Failed to read SSH key file {}", path.display()), e)
        })?;
        return Ok(TunnelIdentity::new(key));
    }

    match &source.ssh {
        Some(key) if !key.trim().is_empty() => Ok(TunnelIdentity::new(key.clone())),
        _ => Err(PgCopyError::secret(
            format!("Secret '{}' has no ssh key", config.source.secret),
            Some("Set bastion.private_key_path or store the key in the secret's ssh field"),
        )),
    }
}
