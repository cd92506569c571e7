//! Local TCP forwarder.
//!
//! Accepts connections on a local listener and relays each one over its own
//! channel opened through a [`ChannelOpener`] (an SSH session in production).

use crate::error::PgCopyError;
use crate::models::ForwardTarget;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Relay buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// A bidirectional byte stream the relay can drive.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// Opens one remote channel per forwarded connection.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(&self, host: &str, port: u16) -> Result<Box<dyn RelayStream>, PgCopyError>;
}

/// Bytes moved by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_remote: u64,
    pub to_local: u64,
}

/// Handle to a running forwarder.
pub struct ForwardHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ForwardHandle {
    /// Address clients should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and cancel every relay.
    pub fn stop(&self) {
        self.cancel.cancel();
        tracing::info!(local_addr = %self.local_addr, "Forwarder stopped");
    }

    /// Stop and wait for the accept loop and all relays to finish.
    pub async fn shutdown(self) {
        self.stop();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forwards local connections to a fixed remote target.
pub struct TunnelForwarder {
    opener: Arc<dyn ChannelOpener>,
    target: ForwardTarget,
    span: tracing::Span,
    tracker: TaskTracker,
}

impl TunnelForwarder {
    /// Create a forwarder whose events are recorded inside `span`.
    pub fn new(opener: Arc<dyn ChannelOpener>, target: ForwardTarget, span: tracing::Span) -> Self {
        Self { opener, target, span, tracker: TaskTracker::new() }
    }

    /// Bind the local listener.
    pub async fn bind(local_host: &str, local_port: u16) -> Result<TcpListener, PgCopyError> {
        TcpListener::bind((local_host, local_port)).await.map_err(|e| {
            PgCopyError::io(format!("Failed to bind forwarder on {local_host}:{local_port}"), e)
        })
    }

    /// Bind the configured endpoint and run the accept loop in the background.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<ForwardHandle, PgCopyError> {
        let listener = Self::bind(&self.target.local_host, self.target.local_port).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PgCopyError::io("Failed to read forwarder address", e))?;

        tracing::info!(
            parent: &self.span,
            local_addr = %local_addr,
            remote = %format!("{}:{}", self.target.remote_host, self.target.remote_port),
            "Forwarder listening"
        );

        let tracker = self.tracker.clone();
        let span = self.span.clone();
        let serve_cancel = cancel.clone();
        tracker.spawn(async move { self.serve(listener, serve_cancel).await }.instrument(span));

        Ok(ForwardHandle { local_addr, cancel, tracker })
    }

    /// Accept connections until `cancel` fires. Each connection gets its own
    /// task; failures there never end this loop.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_relay(stream, peer, cancel.child_token()),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept forwarded connection");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("Forwarder accept loop cancelled");
                    break;
                }
            }
        }
    }

    fn spawn_relay(&self, mut local: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let opener = self.opener.clone();
        let host = self.target.remote_host.clone();
        let port = self.target.remote_port;

        tracing::debug!(peer = %peer, "Accepted forwarded connection");

        self.tracker.spawn(
            async move {
                let mut channel = match opener.open_channel(&host, port).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Failed to open forwarding channel");
                        let _ = local.shutdown().await;
                        return;
                    }
                };

                match relay(&mut local, &mut channel, &cancel).await {
                    Ok(stats) => tracing::debug!(
                        peer = %peer,
                        to_remote = stats.to_remote,
                        to_local = stats.to_local,
                        "Forwarded connection closed"
                    ),
                    Err(e) => tracing::debug!(peer = %peer, error = %e, "Forwarded connection failed"),
                }

                let _ = local.shutdown().await;
                let _ = channel.shutdown().await;
            }
            .instrument(self.span.clone()),
        );
    }
}

/// Copy bytes both ways until either side reaches EOF, an I/O error occurs,
/// or `cancel` fires. Cancellation also interrupts a write blocked on a peer
/// that stopped reading.
pub async fn relay<L, R>(
    local: &mut L,
    remote: &mut R,
    cancel: &CancellationToken,
) -> Result<RelayStats, PgCopyError>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut stats = RelayStats::default();
    let pumped = tokio::select! {
        result = pump(local, remote, &mut stats) => result,
        _ = cancel.cancelled() => Ok(()),
    };
    pumped.map(|()| stats)
}

async fn pump<L, R>(local: &mut L, remote: &mut R, stats: &mut RelayStats) -> Result<(), PgCopyError>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut buf_local = vec![0u8; RELAY_BUFFER_SIZE];
    let mut buf_remote = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        tokio::select! {
            n = local.read(&mut buf_local) => {
                let n = n.map_err(|e| PgCopyError::relay("Local read failed", e))?;
                if n == 0 {
                    return Ok(());
                }
                remote
                    .write_all(&buf_local[..n])
                    .await
                    .map_err(|e| PgCopyError::relay("Channel write failed", e))?;
                stats.to_remote += n as u64;
            }
            n = remote.read(&mut buf_remote) => {
                let n = n.map_err(|e| PgCopyError::relay("Channel read failed", e))?;
                if n == 0 {
                    return Ok(());
                }
                local
                    .write_all(&buf_remote[..n])
                    .await
                    .map_err(|e| PgCopyError::relay("Local write failed", e))?;
                stats.to_local += n as u64;
            }
        }
    }
}
