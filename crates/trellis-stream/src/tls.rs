//! TLS material for STARTTLS on client and server streams.
//!
//! Each virtual host with a certificate gets three configurations: an
//! acceptor for client streams (no client certificate), an acceptor for
//! server streams that asks for but does not require a peer certificate,
//! and a connector presenting the host's certificate on outbound streams.
//! Server streams complete the handshake with any certificate; whether the
//! peer is trusted is decided afterwards by the trust store, so that an
//! untrusted peer can still authenticate with dialback.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use trellis_common::config::AppConfig;
use trellis_federation::FederationError;
use trellis_federation::trust::load_certs;

use crate::session::Role;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error(transparent)]
    Load(#[from] FederationError),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("{0}")]
    Config(String),
}

/// The process crypto provider.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

struct HostTls {
    client: TlsAcceptor,
    server: TlsAcceptor,
    connector: TlsConnector,
}

pub struct TlsContext {
    provider: Arc<CryptoProvider>,
    hosts: HashMap<String, HostTls>,
    /// Used for outbound streams from hosts without a certificate.
    anonymous: TlsConnector,
}

impl TlsContext {
    /// Context with no certificates; STARTTLS is never offered.
    pub fn new(provider: Arc<CryptoProvider>) -> Result<Self, TlsError> {
        let anonymous = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyPeer { provider: provider.clone() }))
            .with_no_client_auth();
        Ok(Self { provider, hosts: HashMap::new(), anonymous: TlsConnector::from(Arc::new(anonymous)) })
    }

    /// Load `cert`/`key` for every configured virtual host that has both.
    pub fn from_config(config: &AppConfig, provider: Arc<CryptoProvider>) -> Result<Self, TlsError> {
        let mut ctx = Self::new(provider)?;
        for (domain, host) in &config.hosts {
            match (&host.cert, &host.key) {
                (Some(cert), Some(key)) => {
                    let chain = load_certs(cert)?;
                    let key = load_key(key)?;
                    ctx.add_host(domain, chain, key)?;
                    tracing::info!(domain = %domain, cert = %cert.display(), "Loaded host certificate");
                }
                (None, None) => {}
                _ => return Err(TlsError::Config(format!("{domain}: cert and key must be set together"))),
            }
        }
        Ok(ctx)
    }

    pub fn add_host(
        &mut self,
        domain: &str,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<(), TlsError> {
        let verifier = Arc::new(AcceptAnyPeer { provider: self.provider.clone() });

        let client = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key.clone_key())?;

        let server = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier.clone())
            .with_single_cert(chain.clone(), key.clone_key())?;

        let connector = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(chain, key)?;

        self.hosts.insert(
            domain.to_lowercase(),
            HostTls {
                client: TlsAcceptor::from(Arc::new(client)),
                server: TlsAcceptor::from(Arc::new(server)),
                connector: TlsConnector::from(Arc::new(connector)),
            },
        );
        Ok(())
    }

    pub fn has_certificate(&self, domain: &str) -> bool {
        self.hosts.contains_key(domain)
    }

    /// Acceptor for an inbound stream to `domain`, if it has a certificate.
    pub fn acceptor(&self, domain: &str, role: Role) -> Option<TlsAcceptor> {
        let host = self.hosts.get(domain)?;
        Some(match role {
            Role::Client => host.client.clone(),
            Role::Server | Role::Outbound => host.server.clone(),
        })
    }

    /// Connector for an outbound stream from `domain`.
    pub fn connector(&self, domain: &str) -> TlsConnector {
        match self.hosts.get(domain) {
            Some(host) => host.connector.clone(),
            None => self.anonymous.clone(),
        }
    }
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| TlsError::Config(format!("{}: {e}", path.display())))
}

/// Completes handshakes with any well-signed peer certificate. Trust is
/// evaluated separately once the handshake is done.
#[derive(Debug)]
struct AcceptAnyPeer {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyPeer {
    fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for AcceptAnyPeer {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

impl ServerCertVerifier for AcceptAnyPeer {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}
