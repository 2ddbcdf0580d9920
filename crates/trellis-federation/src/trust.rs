//! Peer certificate trust for S2S federation.
//!
//! TLS handshakes on server streams accept any peer certificate; whether the
//! peer is actually trusted for the domain it asserts is decided here, after
//! the handshake, so that an untrusted peer can still fall back to dialback.
//!
//! A chain is trusted for a domain when any of these holds:
//! - the leaf's SHA-256 fingerprint is pinned for that domain,
//! - it validates against the configured root certificates,
//! - self-signed certificates are accepted and the leaf is a valid
//!   self-signed certificate for the domain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use trellis_common::config::TlsConfig;

use crate::error::FederationError;

/// Trust established for a session's peer by its TLS certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerTrust {
    /// No TLS handshake has completed.
    #[default]
    Unknown,
    Trusted,
    Untrusted,
}

impl PeerTrust {
    pub fn is_trusted(self) -> bool {
        self == Self::Trusted
    }

    /// TLS completed but the certificate did not establish trust.
    pub fn needs_dialback(self) -> bool {
        self == Self::Untrusted
    }
}

pub struct TrustStore {
    roots: Arc<RootCertStore>,
    /// domain → lowercase hex SHA-256 of the leaf certificate
    pinned: HashMap<String, String>,
    provider: Arc<CryptoProvider>,
}

impl TrustStore {
    pub fn new(roots: RootCertStore, pinned: HashMap<String, String>, provider: Arc<CryptoProvider>) -> Self {
        let pinned = pinned
            .into_iter()
            .map(|(domain, fp)| (domain.to_lowercase(), normalize_fingerprint(&fp)))
            .collect();
        Self { roots: Arc::new(roots), pinned, provider }
    }

    /// Trust store with no roots and no pins. Only self-signed acceptance can
    /// establish trust.
    pub fn empty(provider: Arc<CryptoProvider>) -> Self {
        Self::new(RootCertStore::empty(), HashMap::new(), provider)
    }

    /// Build from `[tls]` configuration.
    pub fn from_config(cfg: &TlsConfig, provider: Arc<CryptoProvider>) -> Result<Self, FederationError> {
        let mut roots = RootCertStore::empty();
        if let Some(path) = &cfg.trusted_roots {
            let certs = load_certs(path)?;
            let (added, ignored) = roots.add_parsable_certificates(certs);
            tracing::info!(path = %path.display(), added, ignored, "Loaded trusted root certificates");
        }
        Ok(Self::new(roots, cfg.pinned.clone(), provider))
    }

    /// Is `chain` (leaf first) trusted for `domain`?
    pub fn trusted(&self, chain: &[CertificateDer<'_>], domain: &str, accept_self_signed: bool) -> bool {
        let Some((leaf, intermediates)) = chain.split_first() else {
            return false;
        };

        if let Some(pin) = self.pinned.get(domain) {
            return fingerprint(leaf) == *pin;
        }

        let Ok(name) = ServerName::try_from(domain.to_owned()) else {
            return false;
        };

        if !self.roots.is_empty() && self.verify(self.roots.clone(), leaf, intermediates, &name) {
            return true;
        }

        if accept_self_signed {
            let mut own = RootCertStore::empty();
            if own.add(leaf.clone().into_owned()).is_ok() {
                return self.verify(Arc::new(own), leaf, &[], &name);
            }
        }
        false
    }

    fn verify(
        &self,
        roots: Arc<RootCertStore>,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        name: &ServerName<'_>,
    ) -> bool {
        let verifier = match WebPkiServerVerifier::builder_with_provider(roots, self.provider.clone()).build() {
            Ok(verifier) => verifier,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot build certificate verifier");
                return false;
            }
        };
        match verifier.verify_server_cert(leaf, intermediates, name, &[], UnixTime::now()) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(server = ?name, error = %e, "Peer certificate not trusted");
                false
            }
        }
    }
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

fn normalize_fingerprint(fp: &str) -> String {
    fp.chars().filter(|c| *c != ':').collect::<String>().to_lowercase()
}

/// Read every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, FederationError> {
    let err = |e: &dyn std::fmt::Display| FederationError::CertificateLoad(path.display().to_string(), e.to_string());
    CertificateDer::pem_file_iter(path)
        .map_err(|e| err(&e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| err(&e))
}
