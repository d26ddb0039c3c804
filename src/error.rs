//! Error types for the line search server.
//!
//! Startup errors (`ConfigError`, `DatasetError::Load`, `TlsError`,
//! `ServerError`) abort the process. `DatasetError::Lookup` and
//! `ConnectionError` are scoped to a single connection.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML config file could not be parsed
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A key had a value of the wrong shape
    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// A key required by the enabled features is absent
    #[error("Missing required configuration: {0}")]
    MissingRequired(&'static str),

    /// The dataset file does not exist or is not a regular file
    #[error("Dataset file '{}' not found", .0.display())]
    DatasetNotFound(PathBuf),

    /// TLS is enabled but a certificate or key file is missing
    #[error("TLS {kind} file '{}' not found", .path.display())]
    TlsFileNotFound { kind: &'static str, path: PathBuf },
}

/// Dataset load and lookup errors.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Dataset could not be read at startup
    #[error("Failed to load dataset from '{}': {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Dataset could not be read while answering a query (reread mode)
    #[error("Failed to read dataset '{}' during lookup: {source}", .path.display())]
    Lookup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Certificate and key loading errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// PEM file could not be read or decoded
    #[error("Failed to read {kind} file '{}': {source}", .path.display())]
    Read {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Certificate file contained no certificates
    #[error("No certificates found in '{}'", .0.display())]
    NoCertificates(PathBuf),

    /// Key file contained no private key
    #[error("No private key found in '{}'", .0.display())]
    NoPrivateKey(PathBuf),

    /// rustls rejected the certificate/key pair
    #[error("Invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Listener errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Host/port did not resolve to any socket address
    #[error("Failed to resolve listen address '{address}': {reason}")]
    Resolve { address: String, reason: String },

    /// Listening socket could not be created or bound
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Accept loop could not continue
    #[error("Server shutdown: {0}")]
    Shutdown(String),
}

/// Per-connection transport errors. None of these reach the accept loop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client did not finish sending its query in time
    #[error("Read timed out after {0:?}")]
    ReadTimeout(std::time::Duration),

    /// Client did not accept the response in time
    #[error("Write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),
}

/// Query client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Server could not be reached
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Host is neither a DNS name nor an IP address usable for TLS
    #[error("Invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}
