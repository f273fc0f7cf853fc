//! Immutable runtime configuration
//!
//! Constructed once at startup (the binary owns argument parsing) and
//! passed by reference into each component.

use std::path::PathBuf;

/// Runtime configuration for one process
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to serve on or connect to
    pub host: String,
    /// Port to serve on or connect to
    pub port: u16,
    /// Display name for the local user
    pub username: String,
    /// Normalized display color (6 hex digits, lowercase, no '#')
    pub color: String,
    /// Run as the server; otherwise run as a client
    pub serve: bool,
    /// Mutual-TLS material; `None` disables transport security
    pub tls: Option<TlsPaths>,
}

/// Certificate material for mutual TLS
#[derive(Debug, Clone)]
pub struct TlsPaths {
    /// PEM bundle holding this peer's certificate chain and private key
    pub certfile: PathBuf,
    /// Certificate authority used to verify the remote peer
    pub cafile: PathBuf,
}
