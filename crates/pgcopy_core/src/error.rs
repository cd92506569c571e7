//! Error types for pgcopy.
//!
//! Errors fall into three reach levels: session-fatal (tunnel authentication and
//! host identity), table-fatal (schema lookup and reconciliation), and local
//! (one chunk or one forwarded connection). Local errors are logged where they
//! happen and never returned from the public entry points.

use thiserror::Error;

/// Main error type for pgcopy.
#[derive(Debug, Error)]
pub enum PgCopyError {
    /// SSH login was rejected or the private key could not be used.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
    },

    /// The bastion presented a host key with an unexpected fingerprint.
    #[error("Unexpected SSH host key fingerprint: {actual} (expected {expected})")]
    FingerprintMismatch {
        /// Fingerprint pinned in configuration.
        expected: String,
        /// Fingerprint computed from the presented host key.
        actual: String,
    },

    /// SSH transport could not be established or was lost.
    #[error("SSH error: {message}")]
    Ssh {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database connection failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution error with PostgreSQL-specific details.
    #[error("{message}")]
    Query {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// PostgreSQL error code (e.g., "42P01").
        code: Option<String>,
    },

    /// Destination table is absent or has no usable columns.
    #[error("Remote table {schema}.{table} not found or has no columns")]
    SchemaNotFound {
        /// Destination schema.
        schema: String,
        /// Destination table.
        table: String,
    },

    /// Source and destination share no column names.
    #[error("No overlapping columns between {source_table} and {destination_table}")]
    NoOverlap {
        /// Qualified source table.
        source_table: String,
        /// Qualified destination table.
        destination_table: String,
    },

    /// One batch could not be applied on the destination.
    #[error("Chunk {chunk} failed: {message}")]
    ChunkApply {
        /// 1-based chunk number.
        chunk: usize,
        /// Underlying failure text.
        message: String,
    },

    /// Byte relay failure on one forwarded connection.
    #[error("Relay error: {message}")]
    Relay {
        /// Human-readable error message.
        message: String,
        /// Underlying I/O error.
        #[source]
        source: Option<std::io::Error>,
    },

    /// Invalid or missing configuration.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Secret lookup failed.
    #[error("Secret error: {message}")]
    Secret {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
    },

    /// Local I/O failure (listener bind, config files).
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable error message.
        message: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl PgCopyError {
    // ========== Constructors ==========

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check the SSH user and private key".to_string()),
        }
    }

    /// Create a new authentication error with custom hint.
    pub fn authentication_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Authentication { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a fingerprint mismatch error.
    pub fn fingerprint_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::FingerprintMismatch { expected: expected.into(), actual: actual.into() }
    }

    /// Create a new SSH error.
    pub fn ssh(message: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), source: None }
    }

    /// Create a new SSH error with source.
    pub fn ssh_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ssh { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a query error without server details.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), detail: None, hint: None, code: None }
    }

    /// Create a schema-not-found error.
    pub fn schema_not_found(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self::SchemaNotFound { schema: schema.into(), table: table.into() }
    }

    /// Create a no-overlap error.
    pub fn no_overlap(source_table: impl Into<String>, destination_table: impl Into<String>) -> Self {
        Self::NoOverlap {
            source_table: source_table.into(),
            destination_table: destination_table.into(),
        }
    }

    /// Create a chunk apply error.
    pub fn chunk_apply(chunk: usize, message: impl Into<String>) -> Self {
        Self::ChunkApply { chunk, message: message.into() }
    }

    /// Create a relay error from an I/O failure.
    pub fn relay(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Relay { message: message.into(), source: Some(source) }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new secret error.
    pub fn secret(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Secret { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new I/O error with context.
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { message: message.into(), source }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "Authentication",
            Self::FingerprintMismatch { .. } => "Fingerprint",
            Self::Ssh { .. } => "SSH",
            Self::Connection { .. } => "Connection",
            Self::Query { .. } => "Query",
            Self::SchemaNotFound { .. } => "Schema",
            Self::NoOverlap { .. } => "Schema",
            Self::ChunkApply { .. } => "Chunk",
            Self::Relay { .. } => "Relay",
            Self::Config { .. } => "Config",
            Self::Secret { .. } => "Secret",
            Self::Io { .. } => "IO",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::FingerprintMismatch { .. } => {
                Some("Verify the bastion host key out of band before updating the pinned value")
            }
            Self::Ssh { .. } => Some("Check that the bastion is reachable and allows TCP forwarding"),
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::SchemaNotFound { .. } => Some("Create the destination table before copying"),
            Self::NoOverlap { .. } => Some("Source and destination column names must overlap"),
            Self::ChunkApply { .. } => None,
            Self::Relay { .. } => None,
            Self::Config { .. } => Some("Check the pgcopy configuration file"),
            Self::Secret { hint, .. } => hint.as_deref(),
            Self::Io { .. } => Some("Check file permissions and local ports"),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to PgCopyError.
impl From<tokio_postgres::Error> for PgCopyError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            // Connection exceptions (08xxx)
            if code_str.starts_with("08") {
                return PgCopyError::Connection { message, source: Some(Box::new(err)) };
            }

            return PgCopyError::Query {
                message,
                detail: db_err.detail().map(String::from),
                hint: db_err.hint().map(String::from),
                code: Some(code_str.to_string()),
            };
        }

        if err.is_closed() {
            return PgCopyError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        if is_transport_failure(&err) {
            return PgCopyError::Connection { message: err.to_string(), source: Some(Box::new(err)) };
        }

        // Client-side failures, e.g. a returned value that could not be decoded
        PgCopyError::Query { message: message_with_cause(&err), detail: None, hint: None, code: None }
    }
}

/// Whether the driver error was caused by the socket rather than the statement.
fn is_transport_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    err.source().is_some_and(|cause| cause.is::<std::io::Error>())
}

fn message_with_cause(err: &dyn std::error::Error) -> String {
    match err.source() {
        Some(cause) => format!("{err}: {cause}"),
        None => err.to_string(),
    }
}

/// Convert from russh::Error to PgCopyError.
impl From<russh::Error> for PgCopyError {
    fn from(err: russh::Error) -> Self {
        PgCopyError::Ssh { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from std::io::Error to PgCopyError.
impl From<std::io::Error> for PgCopyError {
    fn from(err: std::io::Error) -> Self {
        PgCopyError::Io { message: err.to_string(), source: err }
    }
}

/// Convert from serde_json::Error to PgCopyError.
impl From<serde_json::Error> for PgCopyError {
    fn from(err: serde_json::Error) -> Self {
        PgCopyError::Secret {
            message: format!("JSON error: {err}"),
            hint: Some("Secret payload must be a JSON object".to_string()),
        }
    }
}

/// Convert from keyring::Error to PgCopyError.
impl From<keyring::Error> for PgCopyError {
    fn from(err: keyring::Error) -> Self {
        PgCopyError::Secret {
            message: err.to_string(),
            hint: Some("Grant pgcopy access to the system keychain".to_string()),
        }
    }
}
