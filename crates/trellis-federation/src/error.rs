//! Federation-specific error types.

use thiserror::Error;

/// Errors that can occur in federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Discovery ───────────────────────────────────────────────────────────

    #[error("Failed to resolve server '{0}': {1}")]
    DiscoveryFailed(String, String),

    // ── Remote communication ─────────────────────────────────────────────────

    #[error("Remote server '{0}' is not reachable")]
    RemoteUnreachable(String),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    // ── Certificates ────────────────────────────────────────────────────────

    #[error("Failed to load certificates from '{0}': {1}")]
    CertificateLoad(String, String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
