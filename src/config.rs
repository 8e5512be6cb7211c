use crate::connection::{ConnectOptions, DEFAULT_NETWORK_TIMEOUT};
use crate::ldap_protocol::SearchScope;
use crate::tls::TlsOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub tls: TlsOptions,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// ldap:// or ldaps:// URI of the directory server.
    pub uri: String,
    /// LDAP protocol version sent in bind requests (default 3).
    pub protocol_version: Option<i32>,
    /// Connect and StartTLS timeout in milliseconds (default 1000).
    pub network_timeout_ms: Option<u64>,
    /// Issue StartTLS right after connecting (default false). Not valid with ldaps://.
    pub start_tls: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindConfig {
    pub binddn: Option<String>,
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search base (default "dc=com").
    pub base: Option<String>,
    /// Search filter (default "(objectClass=*)").
    pub filter: Option<String>,
    pub scope: Option<SearchScope>,
    /// Attributes to return; empty means all user attributes.
    pub attrs: Option<Vec<String>>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Transport options for [`crate::Connection::open`].
    pub fn connect_options(&self) -> ConnectOptions {
        let connection = &self.connection;
        ConnectOptions {
            uri: connection.uri.clone(),
            protocol_version: connection.protocol_version.unwrap_or(3),
            network_timeout: connection
                .network_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_NETWORK_TIMEOUT),
            start_tls: connection.start_tls.unwrap_or(false),
            tls: self.tls.clone(),
        }
    }
}

impl SearchConfig {
    pub fn base(&self) -> &str {
        self.base.as_deref().unwrap_or("dc=com")
    }

    pub fn filter(&self) -> &str {
        self.filter.as_deref().unwrap_or("(objectClass=*)")
    }

    pub fn scope(&self) -> SearchScope {
        self.scope.unwrap_or_default()
    }

    pub fn attrs(&self) -> &[String] {
        self.attrs.as_deref().unwrap_or(&[])
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                uri: "ldap://127.0.0.1:389".to_string(),
                protocol_version: Some(3),
                network_timeout_ms: Some(DEFAULT_NETWORK_TIMEOUT.as_millis() as u64),
                start_tls: Some(false),
            },
            tls: TlsOptions::default(),
            bind: BindConfig::default(),
            search: SearchConfig::default(),
        }
    }
}
