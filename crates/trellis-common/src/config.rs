//! Server configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > trellis.toml > defaults

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Load the configuration.
///
/// `path` overrides the default `trellis.toml` lookup; a missing default file
/// is not an error, a missing explicit file is.
pub fn init(path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name("trellis").required(false),
    };

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.client_port", 5222)?
        .set_default("server.server_port", 5269)?
        .set_default("client.max_stanza_size", 65_536)?
        .set_default("client.max_resources_per_account", 5)?
        .set_default("client.max_auth_attempts", 3)?
        .set_default("s2s.max_stanza_size", 131_072)?
        .set_default("s2s.connect_timeout_secs", 10)?
        .add_source(file)
        // Environment variables (TRELLIS__SERVER__HOST, TRELLIS__CLIENT__MAX_STANZA_SIZE, etc.)
        .add_source(
            config::Environment::with_prefix("TRELLIS")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("s2s.blacklist")
                .with_list_parse_key("s2s.whitelist")
                .try_parsing(true),
        )
        .build()?;

    let mut app_config: AppConfig = cfg.try_deserialize()?;
    app_config.normalize();
    Ok(app_config)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub s2s: S2sConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    /// Virtual hosts served by this node, keyed by domain.
    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub client_port: u16,
    /// Port used for server-to-server federation (default 5269).
    pub server_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub max_stanza_size: usize,
    /// Concurrent bound resources allowed per account. Binds beyond this
    /// limit are rejected with `resource-constraint`.
    pub max_resources_per_account: usize,
    /// Failed SASL attempts tolerated before the stream is closed.
    pub max_auth_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S2sConfig {
    pub max_stanza_size: usize,
    /// Per-candidate TCP connect timeout for outbound federation.
    pub connect_timeout_secs: u64,
    /// Domains never federated with.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// When non-empty, the only domains federated with.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// PEM bundle of certificate authorities trusted for peer certificates.
    pub trusted_roots: Option<PathBuf>,
    /// Pinned peer certificates: domain → SHA-256 fingerprint (hex, colons optional).
    #[serde(default)]
    pub pinned: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Storage backend name as registered in the storage registry.
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Connection URL for SQL-backed storage.
    pub database_url: Option<String>,
    /// PEM certificate chain presented by this host.
    pub cert: Option<PathBuf>,
    /// PEM private key for `cert`.
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub accept_self_signed: bool,
    #[serde(default)]
    pub force_s2s_encryption: bool,
    #[serde(default = "default_true")]
    pub cross_domain_messages: bool,
    #[serde(default = "default_max_offline_msgs")]
    pub max_offline_msgs: u32,
}

fn default_storage() -> String {
    "memory".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_offline_msgs() -> u32 {
    150
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            database_url: None,
            cert: None,
            key: None,
            accept_self_signed: false,
            force_s2s_encryption: false,
            cross_domain_messages: true,
            max_offline_msgs: default_max_offline_msgs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), client_port: 5222, server_port: 5269 }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { max_stanza_size: 65_536, max_resources_per_account: 5, max_auth_attempts: 3 }
    }
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            max_stanza_size: 131_072,
            connect_timeout_secs: 10,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Configuration with built-in defaults serving `domains` from memory storage.
    pub fn with_hosts<'a>(domains: impl IntoIterator<Item = &'a str>) -> Self {
        let mut cfg = Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            s2s: S2sConfig::default(),
            tls: TlsConfig::default(),
            hosts: domains.into_iter().map(|d| (d.to_owned(), HostConfig::default())).collect(),
        };
        cfg.normalize();
        cfg
    }

    /// Lowercase every configured domain so lookups match normalized addresses.
    fn normalize(&mut self) {
        self.hosts = self.hosts.drain().map(|(k, v)| (k.to_lowercase(), v)).collect();
        for list in [&mut self.s2s.blacklist, &mut self.s2s.whitelist] {
            for domain in list.iter_mut() {
                *domain = domain.to_lowercase();
            }
        }
    }

    pub fn vhost(&self, domain: &str) -> Option<&HostConfig> {
        self.hosts.get(domain)
    }

    pub fn is_vhost(&self, domain: &str) -> bool {
        self.hosts.contains_key(domain)
    }

    /// Federation ACL: may `local` exchange traffic with `remote`?
    pub fn s2s_allowed(&self, local: &str, remote: &str) -> bool {
        if self.is_vhost(remote) {
            return false;
        }
        if self.s2s.blacklist.iter().any(|d| d == remote) {
            return false;
        }
        if !self.s2s.whitelist.is_empty() && !self.s2s.whitelist.iter().any(|d| d == remote) {
            return false;
        }
        self.vhost(local).is_some_and(|h| h.cross_domain_messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_are_normalized() {
        let cfg = AppConfig::with_hosts(["A.Example"]);
        assert!(cfg.is_vhost("a.example"));
        assert!(!cfg.is_vhost("A.Example"));
    }

    #[test]
    fn federation_acl() {
        let mut cfg = AppConfig::with_hosts(["a.example"]);
        assert!(cfg.s2s_allowed("a.example", "b.example"));
        assert!(!cfg.s2s_allowed("a.example", "a.example"));
        assert!(!cfg.s2s_allowed("unknown.example", "b.example"));

        cfg.s2s.blacklist.push("b.example".into());
        assert!(!cfg.s2s_allowed("a.example", "b.example"));

        cfg.s2s.blacklist.clear();
        cfg.s2s.whitelist.push("c.example".into());
        assert!(!cfg.s2s_allowed("a.example", "b.example"));
        assert!(cfg.s2s_allowed("a.example", "c.example"));

        cfg.hosts.get_mut("a.example").unwrap().cross_domain_messages = false;
        assert!(!cfg.s2s_allowed("a.example", "c.example"));
    }
}
