//! Error types for the ldapsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Directory watcher errors
// ---------------------------------------------------------------------------

/// Errors raised while turning directory protocol responses into events.
///
/// Every variant is fatal to the current synchronization cycle.
#[derive(Debug, Error)]
pub enum WatchError {
    /// A response is missing a required control or has an unrecognised shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An entry matched none of the configured object classes.
    #[error("unrecognised entry {0}")]
    UnrecognisedEntry(String),

    /// The identifier embedded in an entry disagrees with its sync state
    /// control.
    #[error("SyncId {syncid} mismatch for entry {dn} ({found})")]
    SyncIdMismatch {
        syncid: String,
        found: String,
        dn: String,
    },

    /// A control value could not be BER-decoded.
    #[error("invalid LDAP control: {0}")]
    InvalidControl(String),

    /// Connection, bind or transport failure.
    #[error("LDAP error: {0}")]
    Ldap(String),

    /// The search completed with a non-success result code.
    #[error("LDAP search failed (rc {rc}): {text}")]
    SearchFailed { rc: u32, text: String },

    /// Recording a response to the trace stream failed.
    #[error(transparent)]
    Trace(#[from] TraceError),
}

impl From<ldap3::LdapError> for WatchError {
    fn from(err: ldap3::LdapError) -> Self {
        WatchError::Ldap(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Trace file errors
// ---------------------------------------------------------------------------

/// Errors from reading or writing trace files.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A `# control:` line or synthetic `control` attribute failed to parse.
    #[error("invalid LDAP control: {0}")]
    InvalidControl(String),

    /// The trace text is not well formed.
    #[error("malformed trace at line {line}: {detail}")]
    Malformed { line: usize, detail: String },

    /// Generic I/O wrapper.
    #[error("trace I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Synchronizer errors
// ---------------------------------------------------------------------------

/// Errors from the reconciliation engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Fatal error from the directory watcher.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Destination or state store failure.
    #[error("sync database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// A raw attribute value could not be parsed by its schema accessor.
    #[error("invalid value for attribute '{attribute}' of {dn}: {detail}")]
    InvalidAttribute {
        dn: String,
        attribute: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the destination and state store persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored column could not be decoded.
    #[error("corrupt {column} value: {detail}")]
    Corrupt { column: String, detail: String },

    /// Attribute projection (de)serialization failed.
    #[error("attribute serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure injected or raised by a non-SQL store.
    #[error("state store error: {0}")]
    Store(String),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
