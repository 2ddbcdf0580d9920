//! Process-wide collaborators shared by every session.

use std::collections::HashMap;
use std::sync::Arc;

use trellis_common::config::AppConfig;
use trellis_db::{MemoryStorage, Storage, StorageError, StorageRegistry};
use trellis_federation::{DnsResolver, SrvResolver, TrustStore};

use crate::connector::{Dial, TcpDialer};
use crate::router::Router;
use crate::tls::{self, TlsContext, TlsError};

/// Configuration, storage, TLS material, the router and the outbound
/// connection machinery for one server process.
pub struct Node {
    pub config: Arc<AppConfig>,
    pub router: Router,
    pub tls: TlsContext,
    pub trust: TrustStore,
    storage: HashMap<String, Arc<dyn Storage>>,
    resolver: Arc<dyn SrvResolver>,
    dialer: Arc<dyn Dial>,
}

impl Node {
    pub fn builder(config: AppConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            storage: HashMap::new(),
            tls: None,
            trust: None,
            resolver: None,
            dialer: None,
        }
    }

    /// Storage for a virtual host.
    pub fn storage(&self, domain: &str) -> Option<Arc<dyn Storage>> {
        self.storage.get(domain).cloned()
    }

    pub fn resolver(&self) -> &dyn SrvResolver {
        self.resolver.as_ref()
    }

    pub fn dialer(&self) -> &dyn Dial {
        self.dialer.as_ref()
    }
}

pub struct NodeBuilder {
    config: AppConfig,
    storage: HashMap<String, Arc<dyn Storage>>,
    tls: Option<TlsContext>,
    trust: Option<TrustStore>,
    resolver: Option<Arc<dyn SrvResolver>>,
    dialer: Option<Arc<dyn Dial>>,
}

impl NodeBuilder {
    pub fn storage(mut self, domain: &str, storage: Arc<dyn Storage>) -> Self {
        self.storage.insert(domain.to_lowercase(), storage);
        self
    }

    /// Open storage for every virtual host not given one explicitly.
    pub async fn open_storage(mut self, registry: &StorageRegistry) -> Result<Self, StorageError> {
        for (domain, host) in &self.config.hosts {
            if self.storage.contains_key(domain) {
                continue;
            }
            tracing::info!(domain = %domain, backend = %host.storage, "Opening storage");
            let storage = registry.open(host).await?;
            self.storage.insert(domain.clone(), storage);
        }
        Ok(self)
    }

    pub fn tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn trust(mut self, trust: TrustStore) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SrvResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Finish the node. Virtual hosts without storage get an empty in-memory
    /// store; missing TLS material means STARTTLS is not offered.
    pub fn build(mut self) -> Result<Arc<Node>, TlsError> {
        for domain in self.config.hosts.keys() {
            self.storage
                .entry(domain.clone())
                .or_insert_with(|| Arc::new(MemoryStorage::new()) as Arc<dyn Storage>);
        }
        let tls = match self.tls {
            Some(tls) => tls,
            None => TlsContext::new(tls::provider())?,
        };
        Ok(Arc::new(Node {
            config: Arc::new(self.config),
            router: Router::new(),
            tls,
            trust: self.trust.unwrap_or_else(|| TrustStore::empty(tls::provider())),
            storage: self.storage,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(DnsResolver::new())),
            dialer: self.dialer.unwrap_or_else(|| Arc::new(TcpDialer)),
        }))
    }
}
