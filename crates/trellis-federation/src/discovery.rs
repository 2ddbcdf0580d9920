//! Server discovery: resolves a domain to an ordered list of connection candidates.
//!
//! Resolution order (RFC 6120 §3.2):
//!
//! 1. **SRV**: `_xmpp-server._tcp.<domain>`, sorted by priority ascending,
//!    then weight descending.
//! 2. **Direct fallback**: `<domain>:5269` when no SRV records exist.
//!
//! A record with target `.` means the service is explicitly unavailable and
//! is skipped.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;

use crate::error::FederationError;

/// Default server-to-server port.
pub const DEFAULT_S2S_PORT: u16 = 5269;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// One host/port pair to try when connecting to a remote domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source of SRV records. Swappable so connection logic can be exercised
/// without real DNS.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Records for `name`. An empty vector means the name has no records.
    async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>, FederationError>;
}

/// SRV lookups against the system's upstream DNS.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self { inner: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()) }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SrvResolver for DnsResolver {
    async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>, FederationError> {
        match self.inner.srv_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: srv.target().to_string(),
                })
                .collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(FederationError::DiscoveryFailed(name.to_owned(), e.to_string())),
        }
    }
}

/// Fixed SRV answers keyed by query name. Names without an entry have no records.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    records: HashMap<String, Vec<SrvRecord>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, domain: &str, records: Vec<SrvRecord>) -> Self {
        self.records.insert(srv_name(domain), records);
        self
    }
}

#[async_trait]
impl SrvResolver for StaticResolver {
    async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>, FederationError> {
        Ok(self.records.get(name).cloned().unwrap_or_default())
    }
}

/// The SRV query name for server-to-server connections to `domain`.
pub fn srv_name(domain: &str) -> String {
    format!("_xmpp-server._tcp.{domain}")
}

/// Order SRV records into connection candidates, falling back to
/// `(domain, 5269)` when there are none.
pub fn order_candidates(domain: &str, mut records: Vec<SrvRecord>) -> Vec<Candidate> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    let candidates: Vec<Candidate> = records
        .into_iter()
        .filter_map(|rr| {
            let host = rr.target.trim_end_matches('.');
            (!host.is_empty()).then(|| Candidate { host: host.to_owned(), port: rr.port })
        })
        .collect();

    if candidates.is_empty() {
        return vec![Candidate { host: domain.to_owned(), port: DEFAULT_S2S_PORT }];
    }
    candidates
}

/// Resolve `domain` into an ordered, non-empty candidate list. Lookup
/// failures are treated like an empty answer.
pub async fn discover(resolver: &dyn SrvResolver, domain: &str) -> Vec<Candidate> {
    let name = srv_name(domain);
    let records = match resolver.lookup(&name).await {
        Ok(records) => records,
        Err(e) => {
            debug!(domain, error = %e, "SRV lookup failed, using fallback");
            Vec::new()
        }
    };
    let candidates = order_candidates(domain, records);
    debug!(domain, candidates = ?candidates, "Discovery resolved");
    candidates
}
