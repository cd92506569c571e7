//! Run configuration loaded from TOML.
//!
//! ```toml
//! [bastion]
//! host = "bastion.example.com"
//! fingerprint = "yeWoYPKmL8txwsBo+DK+u8Oeul6gmYS8lvn5wX6JNpo"
//!
//! [source]
//! secret = "source-db"
//!
//! [[routes]]
//! secret = "sales-eu"
//! tables = ["orders", "customers"]
//! ```

use crate::error::PgCopyError;
use crate::models::copy::{DEFAULT_BATCH_SIZE, DEFAULT_PG_USER, DEFAULT_SCHEMA};
use crate::models::route::DEFAULT_SERVER_PREFIX;
use crate::models::tunnel::{DEFAULT_LOCAL_HOST, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};
use crate::models::{BastionConfig, RouteEntry, RoutingTable};
use crate::services::secrets::SecretStore;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default source database.
pub const DEFAULT_DATABASE: &str = "postgres";

/// Default source connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    pub bastion: BastionSection,
    pub source: SourceSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub copy: CopySection,
    #[serde(default)]
    pub routes: Vec<RouteSection>,
}

/// SSH bastion and its pinned host key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionSection {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub username: String,
    /// Unpadded base64 SHA-256 of the host key
    pub fingerprint: String,
    /// Private key file; when absent the source secret's `ssh` field is used
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

/// Source database reached through the bastion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSection {
    /// Secret holding host, port, login and (optionally) the bastion key
    pub secret: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Local forwarder endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self { local_host: default_local_host(), local_port: 0 }
    }
}

/// Copy tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub row_limit: Option<u64>,
    #[serde(default = "default_server_prefix")]
    pub server_prefix: String,
}

impl Default for CopySection {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, row_limit: None, server_prefix: default_server_prefix() }
    }
}

/// One destination. Unset fields come from the named secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSection {
    pub secret: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub tables: Vec<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_local_host() -> String {
    DEFAULT_LOCAL_HOST.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_server_prefix() -> String {
    DEFAULT_SERVER_PREFIX.to_string()
}

impl ReplicatorConfig {
    /// `<config dir>/pgcopy/pgcopy.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pgcopy").join("pgcopy.toml"))
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, PgCopyError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PgCopyError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), routes = config.routes.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, PgCopyError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| PgCopyError::config(format!("Invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<(), PgCopyError> {
        if self.bastion.host.trim().is_empty() {
            return Err(PgCopyError::config("bastion.host must not be empty"));
        }
        if self.bastion.fingerprint.trim().is_empty() {
            return Err(PgCopyError::config("bastion.fingerprint must not be empty"));
        }
        if self.source.secret.trim().is_empty() {
            return Err(PgCopyError::config("source.secret must not be empty"));
        }
        if self.copy.batch_size == 0 {
            return Err(PgCopyError::config("copy.batch_size must be at least 1"));
        }
        for (i, route) in self.routes.iter().enumerate() {
            if route.secret.trim().is_empty() {
                return Err(PgCopyError::config(format!("routes[{i}].secret must not be empty")));
            }
            if route.tables.is_empty() {
                return Err(PgCopyError::config(format!("routes[{i}].tables must not be empty")));
            }
        }
        Ok(())
    }

    /// Bastion endpoint and login.
    pub fn bastion(&self) -> BastionConfig {
        BastionConfig::new(&self.bastion.host)
            .with_port(self.bastion.port)
            .with_username(&self.bastion.username)
    }

    /// Source connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.source.connect_timeout_secs)
    }

    /// Resolve every route against `store`.
    pub fn routing_table(&self, store: &dyn SecretStore) -> Result<RoutingTable, PgCopyError> {
        let mut routes = Vec::with_capacity(self.routes.len());

        for section in &self.routes {
            let record = store.require(&section.secret)?;

            let database = section
                .database
                .clone()
                .or_else(|| record.db_instance_identifier.clone())
                .ok_or_else(|| {
                    PgCopyError::config(format!(
                        "Route '{}' has no database and its secret has no dbInstanceIdentifier",
                        section.secret
                    ))
                })?;

            let host = section.host.clone().unwrap_or_else(|| record.host.clone());
            if host.is_empty() {
                return Err(PgCopyError::config(format!("Route '{}' has no host", section.secret)));
            }

            let username = section
                .username
                .clone()
                .or_else(|| Some(record.username.clone()).filter(|u| !u.is_empty()))
                .unwrap_or_else(|| DEFAULT_PG_USER.to_string());

            routes.push(RouteEntry {
                host,
                port: section.port.unwrap_or(record.port),
                database,
                username,
                password: record.password.clone(),
                schema: section.schema.clone(),
                tables: section.tables.clone(),
            });
        }

        Ok(RoutingTable::new(routes).with_server_prefix(&self.copy.server_prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::secrets::{MemorySecretStore, SecretRecord};
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
        [bastion]
        host = "bastion.example.com"
        fingerprint = "yeWoYPKmL8txwsBo+DK+u8Oeul6gmYS8lvn5wX6JNpo"

        [source]
        secret = "source-db"

        [[routes]]
        secret = "sales-eu"
        tables = ["orders", "customers"]

        [[routes]]
        secret = "sales-us"
        database = "sales_us"
        host = "10.1.0.9"
        schema = "reporting"
        tables = ["orders"]
    "#;

    fn record(host: &str, identifier: Option<&str>) -> SecretRecord {
        SecretRecord {
            host: host.to_string(),
            port: 5432,
            username: String::new(),
            password: format!("pw-{host}"),
            db_instance_identifier: identifier.map(String::from),
            ssh: None,
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let config = ReplicatorConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.bastion.port, 22);
        assert_eq!(config.bastion.username, "ec2-user");
        assert_eq!(config.source.database, "postgres");
        assert_eq!(config.source.schema, "public");
        assert_eq!(config.tunnel.local_host, "127.0.0.1");
        assert_eq!(config.tunnel.local_port, 0);
        assert_eq!(config.copy.batch_size, 1000);
        assert_eq!(config.copy.server_prefix, "pgcopy_");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let text = format!("{MINIMAL}\n[copy]\nbatch_size = 0\n");
        assert!(matches!(ReplicatorConfig::from_toml_str(&text), Err(PgCopyError::Config { .. })));
    }

    #[test]
    fn test_validation_rejects_route_without_tables() {
        let text = r#"
            [bastion]
            host = "b"
            fingerprint = "f"
            [source]
            secret = "s"
            [[routes]]
            secret = "d"
            tables = []
        "#;
        assert!(ReplicatorConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_routing_table_merges_secrets() {
        let config = ReplicatorConfig::from_toml_str(MINIMAL).unwrap();
        let store = MemorySecretStore::new();
        store.insert("sales-eu", record("10.0.0.5", Some("sales-eu")));
        store.insert("sales-us", record("ignored", None));

        let table = config.routing_table(&store).unwrap();
        assert_eq!(table.routes.len(), 2);
        assert_eq!(table.table_count(), 3);

        let eu = &table.routes[0];
        assert_eq!(eu.database, "sales-eu");
        assert_eq!(eu.username, "postgres");
        assert_eq!(eu.password, "pw-10.0.0.5");
        assert_eq!(eu.server_name(&table.server_prefix), "pgcopy_sales_eu");

        let us = &table.routes[1];
        assert_eq!(us.host, "10.1.0.9");
        assert_eq!(us.database, "sales_us");
        assert_eq!(us.schema, "reporting");
    }

    #[test]
    fn test_routing_table_requires_database() {
        let config = ReplicatorConfig::from_toml_str(MINIMAL).unwrap();
        let store = MemorySecretStore::new();
        store.insert("sales-eu", record("10.0.0.5", None));
        store.insert("sales-us", record("x", None));

        assert!(matches!(config.routing_table(&store), Err(PgCopyError::Config { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pgcopy.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = ReplicatorConfig::load(&path).unwrap();
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.bastion().address(), "bastion.example.com:22");
    }
}
