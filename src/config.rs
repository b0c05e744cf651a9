use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use anyhow::{Context, Result};

use crate::transport::queue::DEFAULT_MAX_PDU_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub server: ServerOptions,
    /// Accounts accepted by the bundled static authorizer.
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// ldap://host:port, ldaps://host:port or ldap://:port
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub allow_anonymous: bool,
    /// Operations other than bind, unbind, abandon, StartTLS, WhoAmI and Root
    /// DSE reads need a successful bind first.
    pub require_authentication: bool,
    pub naming_contexts: Vec<String>,
    pub vendor_name: Option<String>,
    pub vendor_version: Option<String>,
    /// Idle connections are dropped after this many seconds.
    pub read_timeout_sec: Option<u64>,
    /// Paging cookies expire after this many seconds without use.
    pub paging_ttl_sec: u64,
    /// Paged searches one connection may keep open at once.
    pub max_paged_searches: usize,
    /// Largest request PDU accepted, in bytes.
    pub max_pdu_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            require_authentication: false,
            naming_contexts: Vec::new(),
            vendor_name: Some(env!("CARGO_PKG_NAME").to_string()),
            vendor_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            read_timeout_sec: None,
            paging_ttl_sec: 300,
            max_paged_searches: 16,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub dn: String,
    pub password: String,
    /// SASL PLAIN authentication identity; defaults to the DN.
    pub username: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            tls: None,
            server: ServerOptions::default(),
            users: Vec::new(),
            metrics_listen: None,
        }
    }
}

/// Connection settings for [`crate::client::LdapClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Tried in order until one accepts the connection. Entries may be URIs
    /// (`ldap://`, `ldaps://`) or `host[:port]`.
    pub servers: Vec<String>,
    pub port: u16,
    pub use_ssl: bool,
    pub version: i64,
    pub timeout_connect_sec: u64,
    pub timeout_read_sec: Option<u64>,
    pub base_dn: String,
    pub ca_file: Option<String>,
    /// Accept any server certificate (tests and internal networks only).
    pub tls_skip_verify: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            servers: vec!["localhost".to_string()],
            port: 389,
            use_ssl: false,
            version: 3,
            timeout_connect_sec: 5,
            timeout_read_sec: None,
            base_dn: String::new(),
            ca_file: None,
            tls_skip_verify: false,
        }
    }
}
