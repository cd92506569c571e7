//! SSH tunnel to the bastion host.
//!
//! The bastion's host key is pinned by SHA-256 fingerprint; an unexpected key
//! aborts the handshake before any credential is sent.

use crate::error::PgCopyError;
use crate::models::{BastionConfig, TunnelIdentity};
use crate::services::forward::{ChannelOpener, RelayStream};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use russh::client;
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Inactivity timeout for the SSH transport.
const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Interval between SSH keepalive requests.
const SSH_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Fingerprint of a host key: unpadded base64 of the SHA-256 of its wire bytes.
pub fn host_key_fingerprint(key_bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(Sha256::digest(key_bytes))
}

/// Fingerprint of an OpenSSH public key line (`ssh-ed25519 AAAA... comment`).
pub fn fingerprint_from_openssh_public_key(line: &str) -> Result<String, PgCopyError> {
    let encoded = line.split_whitespace().nth(1).ok_or_else(|| {
        PgCopyError::config("Public key must be in OpenSSH format: <type> <base64> [comment]")
    })?;

    let key = russh_keys::parse_public_key_base64(encoded)
        .map_err(|e| PgCopyError::config(format!("Failed to parse public key: {e}")))?;

    Ok(host_key_fingerprint(&key.public_key_bytes()))
}

/// Client handler that accepts only the pinned host key.
struct PinnedHostKey {
    expected: String,
    observed: Arc<parking_lot::Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for PinnedHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = host_key_fingerprint(&server_public_key.public_key_bytes());
        let accepted = actual == self.expected;

        if !accepted {
            tracing::error!(
                expected = %self.expected,
                actual = %actual,
                "Rejecting SSH host key with unexpected fingerprint"
            );
        }

        *self.observed.lock() = Some(actual);
        Ok(accepted)
    }
}

/// An authenticated SSH session to the bastion.
pub struct TunnelSession {
    handle: Arc<Mutex<client::Handle<PinnedHostKey>>>,
    address: String,
    fingerprint: String,
}

impl TunnelSession {
    /// `host:port` of the bastion.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The verified host key fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Disconnect the transport. Channels opened from this session stop working.
    pub async fn close(&self) -> Result<(), PgCopyError> {
        let handle = self.handle.lock().await;
        handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| PgCopyError::ssh_with_source("Failed to disconnect SSH session", e))?;

        tracing::info!(bastion = %self.address, "SSH session closed");
        Ok(())
    }
}

#[async_trait]
impl ChannelOpener for TunnelSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<Box<dyn RelayStream>, PgCopyError> {
        // Hold the lock only while the channel is negotiated
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    PgCopyError::ssh_with_source(format!("Failed to open SSH channel to {host}:{port}"), e)
                })?
        };

        Ok(Box::new(channel.into_stream()))
    }
}

/// Establishes SSH sessions to the bastion.
pub struct TunnelService;

impl TunnelService {
    /// Connect, verify the host key against `expected_fingerprint`, and log in
    /// with `identity`. Neither verification nor login is retried.
    pub async fn connect(
        bastion: &BastionConfig,
        identity: &TunnelIdentity,
        expected_fingerprint: &str,
    ) -> Result<TunnelSession, PgCopyError> {
        let address = bastion.address();
        tracing::info!(bastion = %address, user = %bastion.username, "Opening SSH session");

        let key = Self::decode_identity(identity)?;

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(SSH_INACTIVITY_TIMEOUT),
            keepalive_interval: Some(SSH_KEEPALIVE_INTERVAL),
            ..Default::default()
        });

        let observed = Arc::new(parking_lot::Mutex::new(None));
        let handler = PinnedHostKey {
            expected: expected_fingerprint.to_string(),
            observed: observed.clone(),
        };

        let connected = client::connect(config, (bastion.host.as_str(), bastion.port), handler).await;
        let mut handle = match connected {
            Ok(handle) => handle,
            Err(e) => {
                let seen = observed.lock().take();
                return Err(match seen {
                    Some(actual) if actual != expected_fingerprint => {
                        PgCopyError::fingerprint_mismatch(expected_fingerprint, actual)
                    }
                    _ => PgCopyError::ssh_with_source(
                        format!("Failed to connect to SSH server {address}"),
                        e,
                    ),
                });
            }
        };

        let authenticated = handle
            .authenticate_publickey(&bastion.username, Arc::new(key))
            .await
            .map_err(|e| {
                PgCopyError::authentication_with_hint(
                    format!("SSH key authentication failed: {e}"),
                    "Verify the private key matches an authorized key on the bastion",
                )
            })?;

        if !authenticated {
            return Err(PgCopyError::authentication_with_hint(
                format!("SSH key rejected for {}@{}", bastion.username, bastion.host),
                "Verify the private key matches an authorized key on the bastion",
            ));
        }

        tracing::info!(
            bastion = %address,
            user = %bastion.username,
            fingerprint = %expected_fingerprint,
            "SSH authentication successful"
        );

        Ok(TunnelSession {
            handle: Arc::new(Mutex::new(handle)),
            address,
            fingerprint: expected_fingerprint.to_string(),
        })
    }

    /// Decode the in-memory private key.
    fn decode_identity(identity: &TunnelIdentity) -> Result<KeyPair, PgCopyError> {
        russh_keys::decode_secret_key(identity.private_key(), identity.passphrase()).map_err(|e| {
            let hint = if identity.passphrase().is_some() {
                "Check the key passphrase is correct"
            } else {
                "The key may be encrypted - provide the passphrase"
            };
            PgCopyError::authentication_with_hint(format!("Failed to decode SSH private key: {e}"), hint)
        })
    }
}
