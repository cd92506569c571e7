//! Database and bastion secrets with pluggable providers.
//!
//! A secret is a JSON record in the shape the secret manager stores it:
//!
//! ```json
//! { "host": "db.internal", "port": 5432, "username": "postgres",
//!   "password": "...", "dbInstanceIdentifier": "sales-eu", "ssh": "-----BEGIN ..." }
//! ```
//!
//! - [`FileSecretStore`]: a JSON document mapping secret names to records
//! - [`KeychainSecretStore`]: one record per OS keychain entry
//! - [`MemorySecretStore`]: records held in process memory

use crate::error::PgCopyError;
use crate::models::copy::DEFAULT_PG_PORT;

use keyring::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Service name used for keychain entries.
const KEYRING_SERVICE: &str = "dev.pgcopy.pgcopy";

fn default_port() -> u16 {
    DEFAULT_PG_PORT
}

/// One stored secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db_instance_identifier: Option<String>,
    /// Private key text for the bastion login
    #[serde(default)]
    pub ssh: Option<String>,
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("db_instance_identifier", &self.db_instance_identifier)
            .field("ssh", &self.ssh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ============================================================================
// SecretStore Trait
// ============================================================================

/// Read access to named secrets.
pub trait SecretStore: Send + Sync {
    /// Look up a secret; `Ok(None)` when it does not exist.
    fn get(&self, name: &str) -> Result<Option<SecretRecord>, PgCopyError>;

    /// Look up a secret that must exist.
    fn require(&self, name: &str) -> Result<SecretRecord, PgCopyError> {
        self.get(name)?.ok_or_else(|| {
            PgCopyError::secret(
                format!("Secret '{name}' not found in {} store", self.name()),
                Some("Check the secret name in the configuration"),
            )
        })
    }

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

// ============================================================================
// FileSecretStore
// ============================================================================

/// Secrets read from a JSON file of `name -> record`.
#[derive(Debug)]
pub struct FileSecretStore {
    file_path: PathBuf,
    cache: RwLock<HashMap<String, SecretRecord>>,
}

impl FileSecretStore {
    /// Open and load `file_path`.
    pub fn open(file_path: impl AsRef<Path>) -> Result<Self, PgCopyError> {
        let store =
            Self { file_path: file_path.as_ref().to_path_buf(), cache: RwLock::new(HashMap::new()) };
        store.reload()?;
        Ok(store)
    }

    /// Re-read the file into the cache.
    pub fn reload(&self) -> Result<(), PgCopyError> {
        let contents = fs::read_to_string(&self.file_path).map_err(|e| {
            PgCopyError::secret(
                format!("Failed to read secrets file {}: {e}", self.file_path.display()),
                Some("Check that the secrets file exists and is readable"),
            )
        })?;

        let records: HashMap<String, SecretRecord> = if contents.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&contents).map_err(|e| {
                PgCopyError::secret(
                    format!("Invalid secrets file format: {e}"),
                    Some("The file must be a JSON object of secret name to record"),
                )
            })?
        };

        tracing::debug!(path = %self.file_path.display(), secrets = records.len(), "Loaded secrets file");
        *self.cache.write() = records;
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> Result<Option<SecretRecord>, PgCopyError> {
        Ok(self.cache.read().get(name).cloned())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ============================================================================
// KeychainSecretStore
// ============================================================================

/// Secrets stored as JSON in the OS keychain.
#[derive(Debug, Clone)]
pub struct KeychainSecretStore {
    service: String,
}

impl Default for KeychainSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeychainSecretStore {
    pub fn new() -> Self {
        Self { service: KEYRING_SERVICE.to_string() }
    }
}

impl SecretStore for KeychainSecretStore {
    fn get(&self, name: &str) -> Result<Option<SecretRecord>, PgCopyError> {
        let entry = Entry::new(&self.service, name)?;
        let text = match entry.get_password() {
            Ok(text) => text,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => {
                return Err(PgCopyError::secret(
                    format!("Failed to read keychain entry '{name}': {e}"),
                    Some("Grant pgcopy access to the keychain"),
                ))
            }
        };

        let record = serde_json::from_str(&text).map_err(|e| {
            PgCopyError::secret(format!("Keychain entry '{name}' is not a valid secret record: {e}"), None)
        })?;
        Ok(Some(record))
    }

    fn name(&self) -> &'static str {
        "keychain"
    }
}

// ============================================================================
// MemorySecretStore
// ============================================================================

/// Secrets held in memory.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, record: SecretRecord) {
        self.records.write().insert(name.into(), record);
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<SecretRecord>, PgCopyError> {
        Ok(self.records.read().get(name).cloned())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
