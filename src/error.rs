//! Error types for the feeder using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase. Every kind is fatal at the process
//! level; the top-level [`FeederError`] maps each kind to a distinguished
//! exit code.

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No target relation was supplied on the command line or in the config file.
    #[snafu(display("A target relation is required (pass it as the first argument)"))]
    MissingRelation,

    /// Poll interval of zero would spin on the lock.
    #[snafu(display("Poll interval must be at least one second"))]
    ZeroPollInterval,

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },
}

// ============ Buffer Errors ============

/// Errors that can occur while locking, reading, or truncating the buffer file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BufferError {
    /// Standard input could not be adopted as the buffer file handle.
    #[snafu(display("Failed to adopt stdin as the buffer file"))]
    Stdin { source: std::io::Error },

    /// The buffer file could not be opened read/write.
    #[snafu(display("Failed to open buffer file {path}"))]
    Open {
        path: String,
        source: std::io::Error,
    },

    /// The buffer handle does not refer to a seekable regular file.
    #[snafu(display("Buffer handle is not a regular file"))]
    Seek { source: std::io::Error },

    /// The blocking lock task was cancelled or panicked.
    #[snafu(display("Lock acquisition task failed"))]
    LockTask { source: tokio::task::JoinError },

    /// Taking the exclusive lock failed at the syscall level.
    #[snafu(display("Failed to take the exclusive lock on the buffer file"))]
    Lock { source: std::io::Error },

    /// Reading the buffer length failed.
    #[snafu(display("Failed to stat the buffer file"))]
    Stat { source: std::io::Error },

    /// Mapping the buffer contents failed.
    #[snafu(display("Failed to map the buffer file"))]
    Map { source: std::io::Error },

    /// Rewriting the unconsumed tail to the front of the file failed.
    #[snafu(display("Failed to rewrite the buffer tail"))]
    Rewrite { source: std::io::Error },

    /// Shrinking the buffer file failed.
    #[snafu(display("Failed to truncate the buffer file"))]
    Truncate { source: std::io::Error },
}

// ============ Client Errors ============

/// Errors raised by the PostgreSQL client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    /// The connection descriptor could not be parsed.
    #[snafu(display("Invalid connection descriptor: {message}"))]
    Descriptor { message: String },

    /// The TCP connection could not be established.
    #[snafu(display("Failed to connect to the server"))]
    Connect { source: std::io::Error },

    /// Encoding a frontend message failed.
    #[snafu(display("Failed to encode a protocol message"))]
    Encode { source: std::io::Error },

    /// A protocol read or write failed.
    #[snafu(display("Connection I/O failed"))]
    Io { source: std::io::Error },

    /// The server sent something the protocol state does not allow.
    #[snafu(display("Protocol violation: {message}"))]
    Protocol { message: String },

    /// The server rejected the session during startup or authentication.
    #[snafu(display("Server rejected the connection: {message}"))]
    Startup { message: String },

    /// The server demanded an authentication mechanism the client does not speak.
    #[snafu(display("Unsupported authentication mechanism: {mechanism}"))]
    AuthUnsupported { mechanism: String },

    /// The server asked for a password but the descriptor carries none.
    #[snafu(display("Server requested a password but none was configured"))]
    PasswordRequired,

    /// The SCRAM exchange failed (bad credentials or a lying server).
    #[snafu(display("SCRAM authentication failed"))]
    Sasl { source: std::io::Error },

    /// The server rejected a simple statement.
    #[snafu(display("Statement failed: {message}"))]
    Statement { message: String },

    /// The server refused or aborted a bulk load.
    #[snafu(display("Bulk load failed: {message}"))]
    BulkLoad { message: String },
}

// ============ Feeder Error (top-level) ============

/// Top-level errors that aggregate all error types.
///
/// Each variant carries the phase it occurred in, which determines the
/// process exit code reported to the supervisor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FeederError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Could not establish the database session at startup.
    #[snafu(display("Connection error"))]
    Connection { source: ClientError },

    /// Filesystem-level failure on the buffer file.
    #[snafu(display("Buffer error"))]
    Buffer { source: BufferError },

    /// The server rejected a statement or bulk load mid-cycle.
    #[snafu(display("Load error"))]
    Load { source: ClientError },
}

impl FeederError {
    /// Map the error kind to its distinguished process exit code.
    ///
    /// `0` is reserved for a normal shutdown and `1` is the fallback for
    /// failures outside these kinds.
    pub fn exit_code(&self) -> u8 {
        match self {
            FeederError::Config { .. } => 2,
            FeederError::Connection { .. } => 3,
            FeederError::Buffer { .. } => 4,
            FeederError::Load { .. } => 5,
        }
    }
}
